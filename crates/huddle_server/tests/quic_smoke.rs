#![forbid(unsafe_code)]

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use bytes::BytesMut;
use huddle_protocol::{DEFAULT_MAX_FRAME_SIZE, encode_frame, pb, try_decode_frame_from_buffer};
use quinn::{Endpoint, ServerConfig};
use tokio::sync::oneshot;

const PROTOCOL_VERSION: u32 = 1;
const ALPN: &[u8] = b"huddle-v1";

static LOG_INIT: OnceLock<()> = OnceLock::new();

fn init_test_logging() {
	LOG_INIT.get_or_init(|| {
		if std::env::var_os("HUDDLE_TEST_LOG").is_none() {
			return;
		}

		let _ = tracing_subscriber::fmt()
			.with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "debug".to_string()))
			.with_target(false)
			.try_init();
	});
}

fn make_quic_server(bind_addr: SocketAddr) -> anyhow::Result<(Endpoint, Vec<u8>)> {
	let ck = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).context("generate self-signed cert")?;

	let cert_der = ck.cert.der().to_vec();
	let key_der = ck.signing_key.serialize_der();

	let cert_chain = vec![rustls::pki_types::CertificateDer::from(cert_der.clone())];
	let key = rustls::pki_types::PrivateKeyDer::try_from(key_der)
		.map_err(anyhow::Error::msg)
		.context("parse private key der")?;

	let mut tls_config = rustls::ServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(cert_chain, key)
		.context("build rustls server config")?;
	tls_config.alpn_protocols = vec![ALPN.to_vec()];

	let server_config = ServerConfig::with_crypto(Arc::new(quinn::crypto::rustls::QuicServerConfig::try_from(tls_config)?));
	let endpoint = Endpoint::server(server_config, bind_addr).context("bind quinn endpoint")?;

	Ok((endpoint, cert_der))
}

fn make_quic_client(server_cert_der: &[u8]) -> anyhow::Result<Endpoint> {
	let mut roots = rustls::RootCertStore::empty();
	roots
		.add(rustls::pki_types::CertificateDer::from(server_cert_der.to_vec()))
		.context("trust server cert")?;

	let mut tls_config = rustls::ClientConfig::builder()
		.with_root_certificates(roots)
		.with_no_client_auth();
	tls_config.alpn_protocols = vec![ALPN.to_vec()];

	let client_config =
		quinn::ClientConfig::new(Arc::new(quinn::crypto::rustls::QuicClientConfig::try_from(tls_config)?));

	let mut endpoint = Endpoint::client("127.0.0.1:0".parse().context("parse client bind addr")?)?;
	endpoint.set_default_client_config(client_config);
	Ok(endpoint)
}

async fn send_envelope(send: &mut quinn::SendStream, msg: pb::envelope::Msg) -> anyhow::Result<()> {
	let env = pb::Envelope {
		version: PROTOCOL_VERSION,
		msg: Some(msg),
	};
	let frame = encode_frame(&env, DEFAULT_MAX_FRAME_SIZE).map_err(|e| anyhow!(e))?;
	send.write_all(&frame).await.context("write frame")?;
	Ok(())
}

async fn recv_envelope(recv: &mut quinn::RecvStream, buf: &mut BytesMut) -> anyhow::Result<pb::envelope::Msg> {
	let mut tmp = [0u8; 8192];
	loop {
		if let Some(env) = try_decode_frame_from_buffer::<pb::Envelope>(buf, DEFAULT_MAX_FRAME_SIZE)? {
			return env.msg.ok_or_else(|| anyhow!("empty envelope"));
		}

		let n = recv
			.read(&mut tmp)
			.await
			.context("stream read")?
			.ok_or_else(|| anyhow!("stream closed mid-frame"))?;
		buf.extend_from_slice(&tmp[..n]);
	}
}

/// One-connection presence exchange: accept, read Join, answer with the
/// snapshot, then relay a typing event back at the sender as its peer echo.
async fn run_minimal_server(endpoint: Endpoint, ready_tx: oneshot::Sender<SocketAddr>) -> anyhow::Result<()> {
	init_test_logging();

	let local_addr = endpoint.local_addr().context("server local_addr")?;
	let _ = ready_tx.send(local_addr);

	let Some(connecting) = endpoint.accept().await else {
		return Err(anyhow!("server endpoint closed before accept"));
	};
	let connection = connecting.await.context("accept quic connection")?;
	tracing::info!(remote = %connection.remote_address(), "server: accepted QUIC connection");

	let (mut send, mut recv) = connection.accept_bi().await.context("accept_bi")?;
	let mut buf = BytesMut::with_capacity(16 * 1024);

	let joined = loop {
		match recv_envelope(&mut recv, &mut buf).await? {
			pb::envelope::Msg::Join(j) => break j.user_id,
			_ => continue,
		}
	};

	send_envelope(
		&mut send,
		pb::envelope::Msg::OnlineUsers(pb::OnlineUsers { users: vec![joined.clone()] }),
	)
	.await
	.context("send OnlineUsers")?;

	let typing = loop {
		match recv_envelope(&mut recv, &mut buf).await? {
			pb::envelope::Msg::Typing(t) => break t,
			_ => continue,
		}
	};
	assert_eq!(typing.to, joined, "self-typing in smoke test");

	send_envelope(&mut send, pb::envelope::Msg::PeerTyping(pb::PeerTyping { from: joined }))
		.await
		.context("send PeerTyping")?;

	let _ = send.finish();
	// Keep the connection open until the client finishes its side; returning
	// here would drop the endpoint and abort delivery of the final frame.
	let mut tmp = [0u8; 64];
	while let Ok(Some(_)) = recv.read(&mut tmp).await {}
	Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn quic_smoke_join_and_typing_roundtrip() -> anyhow::Result<()> {
	init_test_logging();

	let _ = rustls::crypto::CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider());

	let bind_addr: SocketAddr = "127.0.0.1:0".parse().context("parse bind addr")?;
	let (server_endpoint, cert_der) = make_quic_server(bind_addr)?;

	let (ready_tx, ready_rx) = oneshot::channel::<SocketAddr>();
	let server_task = tokio::spawn(run_minimal_server(server_endpoint, ready_tx));

	let mut server_addr = ready_rx.await.context("server ready")?;
	if server_addr.ip().is_unspecified() {
		server_addr.set_ip(std::net::IpAddr::V4(std::net::Ipv4Addr::new(127, 0, 0, 1)));
	}

	let client_endpoint = make_quic_client(&cert_der)?;
	let connection = client_endpoint
		.connect(server_addr, "localhost")
		.context("client connect")?
		.await
		.context("client handshake")?;

	let (mut send, mut recv) = connection.open_bi().await.context("open_bi")?;
	let mut buf = BytesMut::with_capacity(16 * 1024);

	send_envelope(
		&mut send,
		pb::envelope::Msg::Join(pb::Join {
			user_id: "smoke".to_string(),
			auth_token: String::new(),
		}),
	)
	.await?;

	let presence = tokio::time::timeout(Duration::from_secs(5), recv_envelope(&mut recv, &mut buf))
		.await
		.context("timeout waiting for presence")??;
	match presence {
		pb::envelope::Msg::OnlineUsers(o) => assert_eq!(o.users, vec!["smoke".to_string()]),
		_ => panic!("expected OnlineUsers first"),
	}

	send_envelope(
		&mut send,
		pb::envelope::Msg::Typing(pb::Typing {
			to: "smoke".to_string(),
			from: String::new(),
		}),
	)
	.await?;

	let peer_typing = tokio::time::timeout(Duration::from_secs(5), recv_envelope(&mut recv, &mut buf))
		.await
		.context("timeout waiting for typing echo")??;
	match peer_typing {
		pb::envelope::Msg::PeerTyping(t) => assert_eq!(t.from, "smoke"),
		_ => panic!("expected PeerTyping"),
	}

	let _ = send.finish();
	drop(connection);

	server_task.await.context("server join")?.context("server run")?;
	client_endpoint.wait_idle().await;
	Ok(())
}

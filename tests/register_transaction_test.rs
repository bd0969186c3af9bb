//! REGISTER transaction integration tests over loopback UDP

use sip_reg_client::infrastructure::protocols::sip::auth::digest_response;
use sip_reg_client::infrastructure::protocols::sip::{
    build_register, ClientState, RegisterParams, ResponseBuilder, SipMethod, SipRequest,
    TimerConfig, TransactionError, TransactionManager, TransportProtocol, UdpTransport,
    UserCredentials,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::timeout;

/// Fake registrar socket
struct Registrar {
    socket: UdpSocket,
}

impl Registrar {
    async fn bind() -> Self {
        Self {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
        }
    }

    fn addr(&self) -> SocketAddr {
        self.socket.local_addr().unwrap()
    }

    async fn recv(&self) -> (SipRequest, SocketAddr) {
        let mut buf = vec![0u8; 65535];
        let (size, source) = timeout(Duration::from_secs(5), self.socket.recv_from(&mut buf))
            .await
            .expect("registrar received nothing")
            .unwrap();
        (SipRequest::parse(&buf[..size]).unwrap(), source)
    }

    async fn reply(&self, builder: ResponseBuilder, request: &SipRequest, to: SocketAddr) {
        let response = builder.to_tag("reg1").build_for_request(request).unwrap();
        self.socket.send_to(&response.to_bytes(), to).await.unwrap();
    }
}

async fn client(
    config: TimerConfig,
    credentials: Option<UserCredentials>,
) -> (Arc<TransactionManager>, SipRequest) {
    let (transport, incoming) = UdpTransport::bind("127.0.0.1:0".parse().unwrap())
        .await
        .unwrap();
    let local_addr = transport.local_addr().unwrap();

    let mut manager = TransactionManager::new(Arc::new(transport), config);
    if let Some(credentials) = credentials {
        manager = manager.with_credentials(credentials);
    }
    let manager = Arc::new(manager);
    tokio::spawn(manager.clone().run(incoming));

    let request = build_register(&RegisterParams {
        registrar_uri: "sip:example.com".to_string(),
        aor: "sip:alice@example.com".to_string(),
        local_addr,
        transport: TransportProtocol::Udp,
        expires: 3600,
    })
    .unwrap();

    (manager, request)
}

/// Timers slow enough that nothing is retransmitted during a test
fn quiet_timers() -> TimerConfig {
    TimerConfig {
        initial_retransmit_interval: Duration::from_secs(5),
        transaction_timeout: Duration::from_secs(10),
        linger_duration: Duration::from_millis(200),
        ..TimerConfig::default()
    }
}

/// Value of `name` in a Digest credentials header
fn auth_param(header: &str, name: &str) -> String {
    header
        .trim_start_matches("Digest ")
        .split(", ")
        .filter_map(|part| part.split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value.trim_matches('"').to_string())
        .unwrap()
}

#[tokio::test]
async fn test_register_with_digest_challenge() {
    let registrar = Registrar::bind().await;
    let (manager, request) = client(
        quiet_timers(),
        Some(UserCredentials::new("alice", "secret")),
    )
    .await;

    let mut handle = manager.send(request, registrar.addr()).await.unwrap();

    let (first, source) = registrar.recv().await;
    assert_eq!(first.method(), Some(SipMethod::Register));
    assert!(first.header("Authorization").is_none());
    registrar
        .reply(
            ResponseBuilder::unauthorized().header(
                "WWW-Authenticate",
                r#"Digest realm="example.com", nonce="f84f1cec41e6cbe5aea9c8e88d359", qop="auth""#,
            ),
            &first,
            source,
        )
        .await;

    let (second, source) = registrar.recv().await;
    assert_eq!(second.cseq(), Some(2));
    assert_eq!(second.call_id(), first.call_id());
    assert_ne!(second.branch(), first.branch());

    let authorization = second.header("Authorization").unwrap();
    let expected = digest_response(
        "alice",
        "secret",
        "example.com",
        "f84f1cec41e6cbe5aea9c8e88d359",
        "REGISTER",
        "sip:example.com",
        Some("auth"),
        &auth_param(&authorization, "nc"),
        &auth_param(&authorization, "cnonce"),
    );
    assert_eq!(auth_param(&authorization, "response"), expected);
    assert_eq!(auth_param(&authorization, "nc"), "00000001");

    registrar.reply(ResponseBuilder::ok(), &second, source).await;

    let ok = timeout(Duration::from_secs(5), handle.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(ok.status_code(), 200);
    assert_eq!(ok.cseq(), Some(2));

    // Sink closes once the linger window ends
    assert!(timeout(Duration::from_secs(5), handle.recv())
        .await
        .unwrap()
        .is_none());
    assert_eq!(handle.state(), ClientState::Terminated);
    assert_eq!(manager.transaction_count().await, 0);
}

#[tokio::test]
async fn test_rejected_register_is_acked() {
    let registrar = Registrar::bind().await;
    let (manager, request) = client(quiet_timers(), None).await;

    let mut handle = manager.send(request, registrar.addr()).await.unwrap();

    let (register, source) = registrar.recv().await;
    registrar
        .reply(ResponseBuilder::new(403), &register, source)
        .await;

    let forbidden = timeout(Duration::from_secs(5), handle.recv())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(forbidden.status_code(), 403);

    let (ack, _) = registrar.recv().await;
    assert_eq!(ack.method(), Some(SipMethod::Ack));
    assert_eq!(ack.branch(), register.branch());
    assert_eq!(ack.header("CSeq"), Some("1 ACK".to_string()));
    assert!(ack.header("To").unwrap().contains("tag=reg1"));

    assert!(timeout(Duration::from_secs(5), handle.recv())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_unanswered_register_retransmits_then_times_out() {
    let registrar = Registrar::bind().await;
    let config = TimerConfig {
        initial_retransmit_interval: Duration::from_millis(20),
        transaction_timeout: Duration::from_millis(300),
        ..TimerConfig::default()
    };
    let (manager, request) = client(config, None).await;
    let branch = request.branch();

    let mut handle = manager.send(request, registrar.addr()).await.unwrap();

    let outcome = timeout(Duration::from_secs(5), handle.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, Err(TransactionError::Timeout(_))));
    assert!(handle.recv().await.is_none());

    // 0, 20, 60, 140 ms: at least the first few made it out
    let mut seen = 0;
    while let Ok((retransmit, _)) = timeout(Duration::from_millis(100), registrar.recv()).await {
        assert_eq!(retransmit.branch(), branch);
        seen += 1;
    }
    assert!(seen >= 3, "only {} transmissions", seen);
}

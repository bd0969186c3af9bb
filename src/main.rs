use sip_reg_client::config::Config;
use sip_reg_client::infrastructure::protocols::sip::{
    build_register, IncomingMessage, RegisterParams, TcpTransport, TransactionError,
    TransactionManager, Transport, TransportProtocol, UdpTransport,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting SIP REGISTER client");

    // Load configuration
    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref())?;
    info!("Configuration loaded: {:?}", config.sip);

    let protocol = config.sip.transport_protocol()?;
    let bind: SocketAddr = config.sip.bind().parse()?;
    let registrar: SocketAddr = config.sip.registrar.parse()?;

    let (transport, incoming, local_addr): (
        Arc<dyn Transport>,
        mpsc::Receiver<IncomingMessage>,
        SocketAddr,
    ) = match protocol {
        TransportProtocol::Udp => {
            let (udp, rx) = UdpTransport::bind(bind).await?;
            let local = udp.local_addr()?;
            (Arc::new(udp), rx, local)
        }
        TransportProtocol::Tcp => {
            let (tcp, rx) = TcpTransport::new();
            (Arc::new(tcp), rx, bind)
        }
    };

    let mut manager = TransactionManager::new(transport, config.transaction.timer_config());
    match config.credentials.clone() {
        Some(credentials) => manager = manager.with_credentials(credentials),
        None => warn!("No credentials configured, challenges will be passed up unanswered"),
    }
    let manager = Arc::new(manager);
    tokio::spawn(manager.clone().run(incoming));

    let request = build_register(&RegisterParams {
        registrar_uri: format!("sip:{}", config.sip.domain),
        aor: format!("sip:{}@{}", config.sip.username, config.sip.domain),
        local_addr,
        transport: protocol,
        expires: config.sip.expires,
    })?;

    let mut handle = manager.send(request, registrar).await?;
    info!("REGISTER sent to {} (transaction {})", registrar, handle.id());

    loop {
        tokio::select! {
            result = handle.recv() => match result {
                Some(Ok(response)) => info!(
                    "Registration response: {} (CSeq {:?})",
                    response.status_code(),
                    response.cseq()
                ),
                Some(Err(TransactionError::Timeout(after))) => {
                    error!("Registrar did not answer within {:?}", after)
                }
                Some(Err(e)) => error!("Registration failed: {}", e),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, deleting transaction");
                handle.delete();
            }
        }
    }

    info!("Transaction finished in state {}", handle.state().name());
    Ok(())
}

//! Gantry - DHCP and network boot service.
//!
//! Wires the configured listeners together and supervises them: the
//! first listener failure, or SIGINT/SIGTERM, shuts everything down.

use tikv_jemallocator::Jemalloc;

#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use gantry::backend::file::FileBackend;
use gantry::backend::BackendReader;
use gantry::config::{
    detect_public_ipv4, BackendConfig, Config, DhcpConfig, HttpConfig, ScriptUrlConfig,
    SyslogConfig, TftpConfig,
};
use gantry::dhcp::{DhcpServer, ReservationHandler};
use gantry::http::{create_router, AppState, TrustedProxies};
use gantry::ipxe::{IpxeBinaries, ScriptRenderer};
use gantry::metrics::Metrics;
use gantry::syslog::SyslogServer;
use gantry::tftp::TftpServer;

/// Deadline for one inventory lookup.
const BACKEND_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser)]
#[command(name = "gantry")]
#[command(about = "DHCP and network boot service for bare-metal provisioning")]
struct Cli {
    /// Log level (debug, info)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Enable the DHCP server
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    dhcp_enabled: bool,

    /// Local IP:Port to listen on for DHCP requests
    #[arg(long, default_value = "0.0.0.0:67")]
    dhcp_addr: SocketAddr,

    /// Interface to bind to for DHCP requests
    #[arg(long)]
    dhcp_iface: Option<String>,

    /// IP address to use in DHCP packets (option 54 and friends)
    #[arg(long)]
    dhcp_ip_for_packet: Option<Ipv4Addr>,

    /// Syslog server IP address to use in DHCP packets (option 7)
    #[arg(long)]
    dhcp_syslog_ip: Option<Ipv4Addr>,

    /// TFTP server IP address to use in DHCP packets (option 66, siaddr)
    #[arg(long)]
    dhcp_tftp_ip: Option<Ipv4Addr>,

    /// HTTP iPXE binaries URL to use in DHCP packets
    #[arg(long)]
    dhcp_http_ipxe_binary_url: Option<String>,

    /// HTTP iPXE script URL to use in DHCP packets
    #[arg(long)]
    dhcp_http_ipxe_script_url: Option<String>,

    /// Prepend the client MAC to the iPXE script URL path
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    dhcp_http_ipxe_script_prepend_mac: bool,

    /// Enable the iPXE TFTP binary server
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    tftp_enabled: bool,

    /// Local IP:Port to listen on for iPXE TFTP binary requests
    #[arg(long, default_value = "0.0.0.0:69")]
    tftp_addr: SocketAddr,

    /// Per-block TFTP timeout in seconds
    #[arg(long, default_value_t = 5)]
    tftp_timeout: u64,

    /// Largest negotiable TFTP block size (512..=65456)
    #[arg(long, default_value_t = 512)]
    tftp_block_size: usize,

    /// Directory holding the iPXE binaries to serve
    #[arg(long, default_value = "/var/lib/gantry/ipxe")]
    ipxe_dir: PathBuf,

    /// iPXE script fragment to patch into served binaries
    #[arg(long, default_value = "")]
    ipxe_script_patch: String,

    /// Enable the iPXE HTTP binary server
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    http_ipxe_binary_enabled: bool,

    /// Enable the iPXE HTTP script server
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    http_ipxe_script_enabled: bool,

    /// Local IP:Port to listen on for HTTP requests
    #[arg(long, default_value = "0.0.0.0:80")]
    http_addr: SocketAddr,

    /// URL where OSIE (kernel/initrd) images are located
    #[arg(long, default_value = "")]
    osie_url: String,

    /// Extra kernel args (k=v k=v) appended to the iPXE script kernel line
    #[arg(long, default_value = "")]
    extra_kernel_args: String,

    /// IP:Port of the workflow server written into the iPXE script
    #[arg(long, default_value = "")]
    tink_server: String,

    /// Use TLS for the workflow server
    #[arg(long, default_value_t = false, action = ArgAction::Set)]
    tink_server_tls: bool,

    /// Comma separated list of trusted proxies in CIDR notation
    #[arg(long, default_value = "")]
    trusted_proxies: String,

    /// Enable the syslog receiver
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    syslog_enabled: bool,

    /// Local IP:Port to listen on for syslog messages
    #[arg(long, default_value = "0.0.0.0:514")]
    syslog_addr: SocketAddr,

    /// Enable the file backend for DHCP and the iPXE script
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    backend_file_enabled: bool,

    /// Hardware YAML file path for the file backend
    #[arg(long)]
    backend_file_path: Option<PathBuf>,
}

impl Cli {
    fn into_config(self) -> Config {
        let public_ip = detect_public_ipv4().unwrap_or(Ipv4Addr::UNSPECIFIED);
        let ip_for_packet = self.dhcp_ip_for_packet.unwrap_or(public_ip);
        let http_port = self.http_addr.port();

        Config {
            log_level: self.log_level,
            syslog: SyslogConfig {
                enabled: self.syslog_enabled,
                bind_addr: self.syslog_addr,
            },
            tftp: TftpConfig {
                enabled: self.tftp_enabled,
                bind_addr: self.tftp_addr,
                block_size: self.tftp_block_size,
                timeout: Duration::from_secs(self.tftp_timeout),
                ipxe_dir: self.ipxe_dir,
                ipxe_patch: self.ipxe_script_patch,
            },
            http: HttpConfig {
                binary_enabled: self.http_ipxe_binary_enabled,
                script_enabled: self.http_ipxe_script_enabled,
                bind_addr: self.http_addr,
                osie_url: self.osie_url,
                extra_kernel_args: self.extra_kernel_args,
                tink_server: self.tink_server,
                tink_server_tls: self.tink_server_tls,
                trusted_proxies: self.trusted_proxies,
            },
            dhcp: DhcpConfig {
                enabled: self.dhcp_enabled,
                bind_addr: self.dhcp_addr,
                bind_interface: self.dhcp_iface,
                ip_for_packet,
                syslog_ip: self.dhcp_syslog_ip.unwrap_or(ip_for_packet),
                tftp_ip: self.dhcp_tftp_ip.unwrap_or(ip_for_packet),
                http_ipxe_binary_url: self
                    .dhcp_http_ipxe_binary_url
                    .unwrap_or_else(|| format!("http://{ip_for_packet}:{http_port}/ipxe")),
                http_ipxe_script: ScriptUrlConfig {
                    url: self
                        .dhcp_http_ipxe_script_url
                        .unwrap_or_else(|| format!("http://{ip_for_packet}/auto.ipxe")),
                    inject_mac: self.dhcp_http_ipxe_script_prepend_mac,
                },
            },
            backend: BackendConfig {
                file_enabled: self.backend_file_enabled,
                file_path: self.backend_file_path,
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Cli::parse().into_config();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    config.validate().context("invalid configuration")?;

    info!("starting gantry");

    let metrics = Metrics::new().context("failed to register metrics")?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // SIGTERM and SIGINT flip the shared shutdown channel.
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
            let mut sigint =
                signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");

            tokio::select! {
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
                _ = sigint.recv() => info!("received SIGINT, shutting down"),
            }
            let _ = shutdown_tx.send(true);
        }
    });

    let backend: Option<Arc<dyn BackendReader>> = match config.backend.file_path {
        Some(ref path) if config.backend.file_enabled => Some(Arc::new(
            FileBackend::new(path).context("failed to load file backend")?,
        )),
        _ => None,
    };

    let binaries = if config.tftp.enabled || config.http.binary_enabled {
        Some(Arc::new(
            IpxeBinaries::load_dir(&config.tftp.ipxe_dir, config.tftp.ipxe_patch.as_bytes())
                .context("failed to load iPXE binaries")?,
        ))
    } else {
        None
    };

    let mut tasks: Vec<(&'static str, JoinHandle<Result<()>>)> = Vec::new();

    if config.syslog.enabled {
        info!("starting syslog server on {}", config.syslog.bind_addr);
        let server = SyslogServer::new(config.syslog.bind_addr, metrics.clone());
        let rx = shutdown_rx.clone();
        tasks.push((
            "syslog",
            spawn_guarded("syslog", shutdown_tx.clone(), async move {
                server.run(rx).await
            }),
        ));
    }

    if config.tftp.enabled {
        info!("starting tftp server on {}", config.tftp.bind_addr);
        let server = TftpServer::new(
            config.tftp.bind_addr,
            Arc::clone(binaries.as_ref().expect("binaries loaded for tftp")),
            config.tftp.block_size,
            config.tftp.timeout,
            metrics.clone(),
        );
        let rx = shutdown_rx.clone();
        tasks.push((
            "tftp",
            spawn_guarded("tftp", shutdown_tx.clone(), async move {
                server.run(rx).await
            }),
        ));
    }

    if config.http.binary_enabled || config.http.script_enabled {
        info!("starting http server on {}", config.http.bind_addr);
        let state = AppState {
            backend: backend.clone(),
            renderer: Arc::new(
                ScriptRenderer::new(
                    &config.http.osie_url,
                    &config.http.extra_kernel_args,
                    config.dhcp.syslog_ip.to_string(),
                    &config.http.tink_server,
                    config.http.tink_server_tls,
                )
                .context("invalid iPXE script template")?,
            ),
            binaries: binaries.clone().unwrap_or_else(|| {
                Arc::new(IpxeBinaries::from_map(Default::default(), &b""[..]))
            }),
            trusted_proxies: Arc::new(
                TrustedProxies::parse(&config.http.trusted_proxies)
                    .context("invalid trusted proxies")?,
            ),
            metrics: metrics.clone(),
            backend_timeout: BACKEND_TIMEOUT,
            start_time: Instant::now(),
        };

        let bind_addr = config.http.bind_addr;
        let router = create_router(
            state,
            config.http.binary_enabled,
            config.http.script_enabled,
        );
        let mut rx = shutdown_rx.clone();
        tasks.push((
            "http",
            spawn_guarded("http", shutdown_tx.clone(), async move {
                let listener = TcpListener::bind(bind_addr)
                    .await
                    .with_context(|| format!("Failed to bind HTTP server to {bind_addr}"))?;
                axum::serve(
                    listener,
                    router.into_make_service_with_connect_info::<SocketAddr>(),
                )
                .with_graceful_shutdown(async move {
                    let _ = rx.changed().await;
                })
                .await
                .context("HTTP server failed")
            }),
        ));
    }

    if config.dhcp.enabled {
        info!("starting dhcp server on {}", config.dhcp.bind_addr);
        let handler = Arc::new(ReservationHandler::new(
            backend
                .clone()
                .context("the DHCP server requires a backend")?,
            config.dhcp.ip_for_packet,
            config.dhcp.syslog_ip,
            config.dhcp.tftp_ip,
            config.dhcp.http_ipxe_binary_url.clone(),
            config.dhcp.http_ipxe_script.url.clone(),
            config.dhcp.http_ipxe_script.inject_mac,
            BACKEND_TIMEOUT,
        ));
        let server = DhcpServer::new(
            config.dhcp.bind_addr,
            config.dhcp.bind_interface.clone(),
            handler,
            metrics.clone(),
        );
        let rx = shutdown_rx.clone();
        tasks.push((
            "dhcp",
            spawn_guarded("dhcp", shutdown_tx.clone(), async move {
                server.run(rx).await
            }),
        ));
    }

    if tasks.is_empty() {
        anyhow::bail!("nothing to do: every subsystem is disabled");
    }

    let mut failed = false;
    for (name, task) in tasks {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => failed = true,
            Err(e) => {
                error!("{} task panicked: {}", name, e);
                failed = true;
            }
        }
    }

    info!("gantry is shutting down");
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

/// Run a listener; its failure flips the shared shutdown channel so the
/// siblings stop too.
fn spawn_guarded<F>(
    name: &'static str,
    shutdown_tx: watch::Sender<bool>,
    future: F,
) -> JoinHandle<Result<()>>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let result = future.await;
        if let Err(ref e) = result {
            error!("{} listener failed: {:#}", name, e);
            let _ = shutdown_tx.send(true);
        }
        result
    })
}

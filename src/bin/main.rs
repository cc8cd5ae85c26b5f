use clap::{Args, Parser, Subcommand};
use log::{error, info};
use mqbench::transport::tcp::TcpConnector;
use mqbench::{
    DelayUnit, FixedBackoff, LinkEstablisher, Receiver, Relay, Report, Role, RunConfig, Sender,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "mqbench")]
#[command(about = "Latency, throughput and loss benchmark for publish/subscribe message paths", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a test in Uniform mode (constant size and rate)
    Uniform {
        #[command(flatten)]
        common: CommonArgs,

        /// Payload size in bytes
        #[arg(short = 's', long, default_value = "1000")]
        message_size: usize,

        /// Number of messages to send (1000 unless a duration is given)
        #[arg(short = 'c', long)]
        message_count: Option<u64>,

        /// Fixed delay between sends, in microseconds (milliseconds with --millis)
        #[arg(long)]
        delay: Option<u64>,
    },

    /// Run a test in Poisson mode (sampled sizes and/or delays)
    Poisson {
        #[command(flatten)]
        common: CommonArgs,

        /// Fixed payload size in bytes, used when --avg-size is absent
        #[arg(short = 's', long)]
        message_size: Option<usize>,

        /// Mean payload size in bytes [1024, 1048576]
        #[arg(long)]
        avg_size: Option<usize>,

        /// Mean delay between sends [1, 1000], in microseconds (milliseconds with --millis)
        #[arg(long)]
        avg_delay: Option<u64>,

        /// Stop after this many messages
        #[arg(short = 'c', long)]
        message_count: Option<u64>,
    },
}

#[derive(Args)]
struct CommonArgs {
    /// Node role
    #[arg(short, long)]
    role: Role,

    /// Test duration in seconds
    #[arg(short, long)]
    duration: Option<u64>,

    /// Interpret delays in milliseconds instead of microseconds
    #[arg(long)]
    millis: bool,

    /// Benchmark name echoed in the report
    #[arg(short, long)]
    name: Option<String>,

    /// Append the report to this file (sender only)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Seed for sampled sizes, delays and payload bytes
    #[arg(long)]
    seed: Option<u64>,

    /// Publisher address of this node (sender and receiver)
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Next hop the sender subscribes to for results
    #[arg(long, default_value = "127.0.0.1:10002")]
    upstream: String,

    /// Node the receiver or broker takes the stream from
    #[arg(long)]
    source: Option<String>,

    /// Node the broker forwards the stream to
    #[arg(long, default_value = "127.0.0.1:20002")]
    destination: String,

    /// Broker publisher address facing the sender
    #[arg(long, default_value = "127.0.0.1:10002")]
    bind_upstream: SocketAddr,

    /// Broker publisher address facing the receiver
    #[arg(long, default_value = "127.0.0.1:20001")]
    bind_downstream: SocketAddr,

    /// Pause after connecting before the first message, in milliseconds
    #[arg(long, default_value = "1000")]
    settle_ms: u64,

    /// Seconds between connection attempts
    #[arg(long, default_value = "5")]
    retry: u64,
}

impl CommonArgs {
    fn apply(&self, mut config: RunConfig) -> RunConfig {
        if let Some(secs) = self.duration {
            config = config.with_duration(Duration::from_secs(secs));
        }
        if self.millis {
            config = config.with_delay_unit(DelayUnit::Millis);
        }
        if let Some(name) = &self.name {
            config = config.with_name(name.clone());
        }
        if let Some(seed) = self.seed {
            config = config.with_seed(seed);
        }
        config
    }

    fn backoff(&self) -> FixedBackoff {
        FixedBackoff::new(Duration::from_secs(self.retry))
    }

    fn link(&self, role: &str) -> LinkEstablisher {
        LinkEstablisher::new(role).with_backoff(self.backoff())
    }

    async fn connector(&self, bind: SocketAddr, peer: &str) -> mqbench::Result<TcpConnector> {
        Ok(TcpConnector::bind(bind)
            .await?
            .with_peer(peer)
            .with_backoff(Arc::new(self.backoff())))
    }
}

/// First Ctrl-C cancels `finish`, a second one cancels `abort`.
fn spawn_interrupt_handler(finish: CancellationToken, abort: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        info!("Interrupted, finishing (press Ctrl-C again to abort)");
        finish.cancel();
        if tokio::signal::ctrl_c().await.is_ok() {
            abort.cancel();
        }
    });
}

async fn run_sender(config: RunConfig, common: &CommonArgs) -> anyhow::Result<()> {
    let bind = common
        .bind
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 10001)));
    let connector = common.connector(bind, &common.upstream).await?;

    let mut sender = Sender::new(config.clone(), connector)?
        .with_link(common.link("SENDER"))
        .with_settle_delay(Duration::from_millis(common.settle_ms));
    spawn_interrupt_handler(
        sender.finish_token().clone(),
        sender.cancellation_token().clone(),
    );

    let outcome = sender.run().await?;
    let report = Report::new(&config, &outcome);
    println!("{}", report.render());

    if let Some(path) = &common.output {
        report.append_to(path)?;
        info!("Report appended to {}", path.display());
    }
    Ok(())
}

async fn run_broker(common: &CommonArgs) -> anyhow::Result<()> {
    let source = common.source.as_deref().unwrap_or("127.0.0.1:10001");
    let upstream = common.connector(common.bind_upstream, source).await?;
    let downstream = common
        .connector(common.bind_downstream, &common.destination)
        .await?;

    let mut relay = Relay::new(upstream, downstream).with_links(
        common.link("BROKER/upstream"),
        common.link("BROKER/downstream"),
    );
    let cancel = relay.cancellation_token().clone();
    spawn_interrupt_handler(cancel.clone(), cancel);

    let stats = relay.run().await?;
    info!(
        "Broker stopped after {} packets ({} bytes)",
        stats.downstream_packets + stats.upstream_packets,
        stats.bytes
    );
    Ok(())
}

async fn run_receiver(config: RunConfig, common: &CommonArgs) -> anyhow::Result<()> {
    let bind = common
        .bind
        .unwrap_or_else(|| SocketAddr::from(([127, 0, 0, 1], 20002)));
    let source = common.source.as_deref().unwrap_or("127.0.0.1:20001");
    let connector = common.connector(bind, source).await?;

    let mut receiver = Receiver::new(connector)
        .with_link(common.link("RECEIVER"))
        .with_duration(config.duration);
    let cancel = receiver.cancellation_token().clone();
    spawn_interrupt_handler(cancel.clone(), cancel);

    receiver.run().await?;
    info!("Receiver stopped after {} runs", receiver.runs_completed());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let (config, common) = match cli.command {
        Commands::Uniform {
            common,
            message_size,
            message_count,
            delay,
        } => {
            let mut config = RunConfig::uniform(message_size);
            match (message_count, common.duration) {
                (Some(count), _) => config = config.with_message_count(count),
                (None, Some(_)) => config = config.without_message_count(),
                (None, None) => {}
            }
            if let Some(delay) = delay {
                config = config.with_delay(delay);
            }
            (common.apply(config), common)
        }

        Commands::Poisson {
            common,
            message_size,
            avg_size,
            avg_delay,
            message_count,
        } => {
            let mut config = RunConfig::poisson();
            if let Some(size) = message_size {
                config = config.with_message_size(size);
            }
            if let Some(avg_size) = avg_size {
                config = config.with_avg_size(avg_size);
            }
            if let Some(avg_delay) = avg_delay {
                config = config.with_avg_delay(avg_delay);
            }
            if let Some(count) = message_count {
                config = config.with_message_count(count);
            }
            (common.apply(config), common)
        }
    };

    let result = match common.role {
        Role::Sender => {
            config.validate()?;
            run_sender(config, &common).await
        }
        Role::Broker => run_broker(&common).await,
        Role::Receiver => run_receiver(config, &common).await,
    };

    if let Err(e) = &result {
        error!("{} failed: {}", common.role, e);
    }
    result
}

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use hh_hub::config::{load_config, resolve_bindings};
use hh_hub::node::publish;
use hh_hub::node::subscribe::{run_subscriber, DzenSink, PipeSink, PrintFormat, PrintSink, Sink};
use hh_hub::{signals, Lifecycle, NodeState, Receiver, Sender, SocketOptions, Template};
use hh_types::address::{AddressSpec, Link, Role};
use hh_types::config::HubConfig;
use hh_types::event::{CodecError, Event, FIELD_SEPARATOR};

#[derive(Parser)]
#[command(name = "hh", version, about = "herbstlufthub — many-to-many event hub for herbstluftwm")]
struct Cli {
    /// Address to bind or connect: ipc://PATH or tcp://HOST:PORT, optionally
    /// prefixed with bind: or connect:
    #[arg(short, long = "address", global = true, env = "HH_ADDRESS", value_delimiter = ',')]
    address: Vec<AddressSpec>,

    /// Which end of the link (default depends on the node)
    #[arg(short, long, global = true)]
    link: Option<Link>,

    /// Prefix topic for subscribers (repeatable)
    #[arg(short, long = "topic", global = true)]
    topic: Vec<String>,

    /// Config file (default: ~/.config/hhub/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish herbstclient idle events
    Hcpub {
        /// Command producing idle events
        #[arg(long)]
        idle_command: Option<String>,
    },
    /// Publish stdin lines, e.g. `herbstclient --idle | hh stdpub`
    Stdpub,
    /// Publish one event
    Onepub {
        /// Milliseconds to wait for subscribers before sending
        #[arg(long)]
        delay_ms: Option<u64>,
        #[command(flatten)]
        event: EventArgs,
    },
    /// Pull on INBOX addresses and republish on the -a addresses
    Pullpub {
        #[arg(required = true)]
        inbox: Vec<AddressSpec>,
    },
    /// Push one event to a pullpub inbox
    Onepush {
        addr: AddressSpec,
        #[command(flatten)]
        event: EventArgs,
    },
    /// Print received events to stdout
    Stdsub {
        /// One JSON object per event instead of the wire line
        #[arg(long)]
        json: bool,
    },
    /// Run a command per event with the formatted event on its stdin
    Subpipe {
        #[arg(short, long)]
        format: Option<String>,
        /// Program and its arguments, passed as given (no shell)
        #[arg(last = true, required = true)]
        command: Vec<String>,
    },
    /// Feed formatted event state to a status bar renderer
    Subdzen {
        #[arg(short, long)]
        format: Option<String>,
        /// Renderer command (default: dzen2)
        #[arg(short, long)]
        renderer: Option<String>,
    },
}

/// `TYPE [ID] [ARGS..]`, or a single already tab-separated record.
#[derive(Args)]
struct EventArgs {
    #[arg(value_name = "TYPE")]
    kind: String,
    id: Option<String>,
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

impl EventArgs {
    fn to_event(&self) -> Result<Event, CodecError> {
        if self.id.is_none() && self.kind.contains(FIELD_SEPARATOR) {
            return self.kind.parse();
        }
        Event::new(
            self.kind.as_str(),
            self.id.as_deref().unwrap_or_default(),
            self.args.iter().map(String::as_str),
        )
    }
}

/// Resolved settings shared by every node.
struct Hub {
    config: HubConfig,
    addresses: Vec<AddressSpec>,
    link: Option<Link>,
    opts: SocketOptions,
}

impl Hub {
    fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_config(cli.config.as_deref())?;
        if !cli.topic.is_empty() {
            config.transport.topics = cli.topic.clone();
        }
        let opts = SocketOptions::from(&config.transport);
        Ok(Self {
            config,
            addresses: cli.address.clone(),
            link: cli.link,
            opts,
        })
    }

    async fn sender(&self, role: Role) -> Result<Sender> {
        let bindings = resolve_bindings(role, &self.addresses, self.link, &self.config.transport)?;
        debug!("{role} bindings: {bindings:?}");
        Sender::open(role, &bindings, &self.opts)
            .await
            .with_context(|| format!("Failed to open {role} socket"))
    }

    async fn receiver(&self, role: Role) -> Result<Receiver> {
        let bindings = resolve_bindings(role, &self.addresses, self.link, &self.config.transport)?;
        debug!("{role} bindings: {bindings:?}");
        Receiver::open(role, &bindings, &self.opts)
            .await
            .with_context(|| format!("Failed to open {role} socket"))
    }

    fn template(&self, format: Option<&str>) -> Result<Template> {
        let source = format.unwrap_or(&self.config.render.format);
        Template::parse(source).with_context(|| format!("Invalid format template {source:?}"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let hub = Hub::new(&cli)?;
    let shutdown = signals::shutdown_token();

    match cli.command {
        Commands::Hcpub { idle_command } => {
            let command = idle_command.unwrap_or_else(|| hub.config.publish.idle_command.clone());
            let sender = hub.sender(Role::Publish).await?;
            let mut echo = tokio::io::stderr();
            publish::hcpub(&sender, &command, &mut echo, &shutdown).await?;
            sender.close().await;
        }
        Commands::Stdpub => {
            let sender = hub.sender(Role::Publish).await?;
            let input = BufReader::new(tokio::io::stdin());
            let mut echo = tokio::io::stdout();
            publish::stdpub(&sender, input, &mut echo, &shutdown).await?;
            sender.close().await;
        }
        Commands::Onepub { delay_ms, event } => {
            let event = event.to_event().context("Invalid event")?;
            let delay = Duration::from_millis(delay_ms.unwrap_or(hub.config.publish.onepub_delay_ms));
            let sender = hub.sender(Role::Publish).await?;
            println!("{event}");
            tokio::select! {
                _ = shutdown.cancelled() => info!("Interrupted before sending"),
                sent = publish::onepub(sender, &event, delay) => { sent?; }
            }
        }
        Commands::Pullpub { inbox } => {
            let outbox = hub.sender(Role::Publish).await?;
            let bindings = resolve_bindings(Role::Pull, &inbox, None, &hub.config.transport)?;
            let mut pull = Receiver::open(Role::Pull, &bindings, &hub.opts)
                .await
                .context("Failed to open pull inbox")?;
            let mut echo = tokio::io::stdout();
            publish::pullpub(&mut pull, &outbox, &mut echo, &shutdown).await?;
            outbox.close().await;
        }
        Commands::Onepush { addr, event } => {
            let event = event.to_event().context("Invalid event")?;
            let sender = Sender::open(Role::Push, &[addr.resolve(Link::Connect)], &hub.opts)
                .await
                .context("Failed to open push socket")?;
            println!("{event}");
            tokio::select! {
                _ = shutdown.cancelled() => info!("Interrupted before sending"),
                sent = publish::onepush(sender, &event, hub.opts.linger) => { sent?; }
            }
        }
        Commands::Stdsub { json } => {
            let format = if json { PrintFormat::Json } else { PrintFormat::Wire };
            subscribe(&hub, "stdsub", &shutdown, || {
                Ok(PrintSink::new(tokio::io::stdout(), format))
            })
            .await?;
        }
        Commands::Subpipe { format, command } => {
            let template = hub.template(format.as_deref())?;
            subscribe(&hub, "subpipe", &shutdown, || {
                Ok(PipeSink::new(command, Box::new(template)))
            })
            .await?;
        }
        Commands::Subdzen { format, renderer } => {
            let template = hub.template(format.as_deref())?;
            let renderer = renderer.unwrap_or_else(|| hub.config.render.renderer_command.clone());
            subscribe(&hub, "subdzen", &shutdown, || {
                DzenSink::spawn(&renderer, Box::new(template)).context("Failed to start renderer")
            })
            .await?;
        }
    }
    Ok(())
}

/// Open the subscribe socket, then the sink, then receive until shutdown.
async fn subscribe<S, F>(
    hub: &Hub,
    node: &'static str,
    shutdown: &CancellationToken,
    make_sink: F,
) -> Result<()>
where
    S: Sink,
    F: FnOnce() -> Result<S>,
{
    let mut lifecycle = Lifecycle::new(node);
    let setup = async {
        let receiver = hub.receiver(Role::Subscribe).await?;
        let sink = make_sink()?;
        Ok::<_, anyhow::Error>((receiver, sink))
    }
    .await;
    let (mut receiver, mut sink) = match setup {
        Ok(parts) => parts,
        Err(e) => {
            lifecycle.advance(NodeState::Faulting);
            return Err(e);
        }
    };
    let stats = run_subscriber(&mut lifecycle, &mut receiver, &mut sink, shutdown).await?;
    debug!(?stats, "{node} done");
    Ok(())
}

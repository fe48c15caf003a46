use clap::{Parser, ValueEnum};
use colloquy::{
    ConversationConfig, ConversationError, ConversationResult, ExchangeName, InMemoryBroker,
    Role, Session,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

mod console;

#[derive(Parser, Debug)]
#[command(name = "colloquy", version)]
#[command(about = "Colloquy - round-based Talker/Listener conversation over a message broker")]
struct Cli {
    /// Role to play: 'start' (talker) or 'listen' (listener)
    #[arg(short, long)]
    role: String,
    /// Exchange name override
    #[arg(short, long)]
    exchange: Option<String>,
    /// Seconds to pause between rounds [default: 3]
    #[arg(short, long)]
    delay: Option<u64>,
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Broker backend
    #[arg(long, value_enum, default_value_t = BrokerKind::default())]
    broker: BrokerKind,
    /// AMQP URL override
    #[arg(long)]
    url: Option<String>,
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BrokerKind {
    /// In-process broker; both roles run here
    Memory,
    /// AMQP server such as RabbitMQ
    Amqp,
}

impl Default for BrokerKind {
    fn default() -> Self {
        if cfg!(feature = "amqp") {
            BrokerKind::Amqp
        } else {
            BrokerKind::Memory
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

fn init_tracing(format: LogFormat) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    // Ignore the error if a subscriber is already installed
    let _ = match format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

fn build_config(cli: &Cli) -> ConversationResult<ConversationConfig> {
    let mut config = match &cli.config {
        Some(path) => ConversationConfig::load_from_file(path)?,
        None => ConversationConfig::default(),
    };

    if let Some(exchange) = &cli.exchange {
        config = config.with_exchange(ExchangeName::parse(exchange)?);
    }
    if let Some(delay) = cli.delay {
        config = config.with_response_delay(Duration::from_secs(delay));
    }
    if let Some(url) = &cli.url {
        config = config.with_broker_url(url.clone());
    }

    config.validate()?;
    Ok(config)
}

fn report_closed(result: ConversationResult<()>) -> ConversationResult<()> {
    match &result {
        Err(err) if err.is_setup_failure() => {}
        _ => println!("{}", console::closing_line()),
    }
    result
}

/// Both roles against one in-process broker
async fn run_in_memory(config: ConversationConfig) -> ConversationResult<()> {
    let broker = InMemoryBroker::new();

    let mut talker = Session::new(broker.clone(), config.clone())
        .on_round(|_, log| console::print_round(Role::Talker, log));
    let mut listener =
        Session::new(broker, config).on_round(|_, log| console::print_round(Role::Listener, log));

    let (talked, listened) = tokio::join!(
        talker.run_as(Role::Talker),
        listener.run_as(Role::Listener)
    );
    report_closed(talked.and(listened).map(|_| ()))
}

#[cfg(feature = "amqp")]
async fn run_amqp(config: ConversationConfig, role: Role) -> ConversationResult<()> {
    use colloquy::{AmqpBroker, AmqpConfig};

    let broker = AmqpBroker::with_config(
        AmqpConfig::new(config.broker_url.clone())
            .with_connection_name(format!("colloquy-{}", role.node())),
    );

    let mut session =
        Session::new(broker, config).on_round(move |_, log| console::print_round(role, log));
    report_closed(session.run_as(role).await.map(|_| ()))
}

#[cfg(not(feature = "amqp"))]
async fn run_amqp(_config: ConversationConfig, _role: Role) -> ConversationResult<()> {
    Err(ConversationError::Configuration(
        "built without AMQP support; use --broker memory".to_string(),
    ))
}

async fn run(cli: Cli) -> ConversationResult<()> {
    let role: Role = cli.role.parse()?;
    let config = build_config(&cli)?;

    match cli.broker {
        BrokerKind::Memory => run_in_memory(config).await,
        BrokerKind::Amqp => run_amqp(config, role).await,
    }
}

fn exit_code(err: &ConversationError) -> ExitCode {
    ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!(error = %err, "Conversation failed");
            eprintln!("Error: {}", err);
            exit_code(&err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::io::Write;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("colloquy").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["--role", "start"]);
        assert_eq!(cli.role, "start");
        assert_eq!(cli.delay, None);
        assert_eq!(cli.log_format, LogFormat::Pretty);

        let config = build_config(&cli).unwrap();
        assert_eq!(config.response_delay, Duration::from_secs(3));
        assert_eq!(config.exchange.as_str(), "colloquy.direct");
    }

    #[test]
    fn test_short_flags_override_config() {
        let cli = parse(&["-r", "listen", "-e", "chat", "-d", "0", "--url", "amqp://broker/"]);
        let config = build_config(&cli).unwrap();

        assert_eq!(config.exchange.as_str(), "chat");
        assert_eq!(config.response_delay, Duration::ZERO);
        assert_eq!(config.broker_url, "amqp://broker/");
    }

    #[test]
    fn test_config_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "exchange = \"from-file\"\nresponse_delay = \"1s\"").unwrap();
        let path = file.path().to_string_lossy().to_string();

        let config = build_config(&parse(&["-r", "start", "-c", &path])).unwrap();
        assert_eq!(config.exchange.as_str(), "from-file");
        assert_eq!(config.response_delay, Duration::from_secs(1));

        let config = build_config(&parse(&["-r", "start", "-c", &path, "-d", "5"])).unwrap();
        assert_eq!(config.response_delay, Duration::from_secs(5));
    }

    #[test]
    fn test_role_is_required() {
        assert!(Cli::try_parse_from(["colloquy"]).is_err());
    }

    #[rstest]
    #[case(&["-r", "start", "-e", "bad name"])]
    #[case(&["-r", "start", "-c", "/nonexistent/colloquy.toml"])]
    fn test_bad_config_exits_with_2(#[case] args: &[&str]) {
        let err = build_config(&parse(args)).unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[tokio::test]
    async fn test_unknown_role_is_configuration_error() {
        let err = run(parse(&["-r", "dance", "--broker", "memory"]))
            .await
            .unwrap_err();
        assert!(matches!(err, ConversationError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_memory_broker_runs_both_roles() {
        let result = run(parse(&["-r", "start", "--broker", "memory", "-d", "0"])).await;
        assert!(result.is_ok());
    }
}

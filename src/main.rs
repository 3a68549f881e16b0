use anyhow::Result;
use cert_agent::{CaClient, CertProvider, Config, Outcome, StateMachine};
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    // Logs go to stderr; stdout is reserved for the Wait-state diagnostic.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cert_agent=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match run() {
        Ok(Outcome::Done(_)) => {
            info!("SSL bootstrap complete");
            ExitCode::SUCCESS
        }
        Ok(Outcome::Exit { code, message }) => {
            println!("{}", message);
            ExitCode::from(code as u8)
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<Outcome> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "agent.toml".to_string());
    let config = Config::from_file(&config_path)?;
    info!(certname = %config.certname, ca_server = %config.ca_server, "Starting SSL bootstrap");

    let provider = CertProvider::new(&config);
    let client = CaClient::new(&config);
    StateMachine::new(&config, provider, client).run()
}

//! Exposes the command line application.
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use console::Term;
use serde_json::Value;
use storefront_client::config::Config;
use storefront_client::metrics;
use storefront_client::{ApiClient, ApiRequest, Credentials, Method, Resource};

use crate::logging;
use crate::output::{self, TerminalObserver};

/// Where the session is kept unless the configuration says otherwise.
const SESSION_FILE_NAME: &str = "session.json";

/// Manage the storefront through its admin API.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Log in as an administrator.
    Login {
        #[arg(long, short)]
        email: String,
        /// Prompted for when omitted.
        #[arg(long, short)]
        password: Option<String>,
    },

    /// End the current session.
    Logout,

    /// Show the state of the current session.
    Status {
        /// Ask the API whether the token is still accepted.
        #[arg(long)]
        validate: bool,
    },

    /// Fetch a path of the admin API.
    Get {
        path: String,
        /// A query parameter, as `key=value`.
        #[arg(long = "param", short, value_parser = parse_param)]
        params: Vec<(String, String)>,
        /// Skip the response cache.
        #[arg(long)]
        no_cache: bool,
    },

    /// Send a request with an arbitrary method.
    Send {
        method: Method,
        path: String,
        /// A JSON request body.
        #[arg(long, short)]
        data: Option<String>,
    },

    /// List the items of a resource.
    List {
        resource: Resource,
        /// A query parameter, as `key=value`.
        #[arg(long = "param", short, value_parser = parse_param)]
        params: Vec<(String, String)>,
    },

    /// Show a single item of a resource.
    Show { resource: Resource, id: String },

    /// List the known resources.
    Resources,
}

fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_owned(), value.to_owned())),
        _ => Err(format!("expected `key=value`, got `{s}`")),
    }
}

fn default_session_file() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join("storefront").join(SESSION_FILE_NAME))
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    logging::init_logging(&config);
    if let Some(ref statsd) = config.metrics.statsd {
        if let Err(err) = metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        ) {
            let dynerr: &dyn std::error::Error = &err;
            tracing::warn!(error = dynerr, "Failed to configure statsd");
        }
    }

    if config.session_file.is_none() {
        config.session_file = default_session_file();
    }
    if let Some(parent) = config.session_file.as_deref().and_then(Path::parent) {
        fs::create_dir_all(parent).context("failed to create session directory")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("storefront")
        .build()
        .context("failed to start the runtime")?;

    runtime.block_on(run(cli.command, config))
}

async fn run(command: Command, config: Config) -> Result<()> {
    let client = ApiClient::builder(config)
        .session_observer(Arc::new(TerminalObserver))
        .build()
        .context("failed to create the API client")?;

    match command {
        Command::Login { email, password } => {
            let password = match password {
                Some(password) => password,
                None => {
                    let term = Term::stderr();
                    term.write_str("Password: ")?;
                    term.read_secure_line()?
                }
            };
            client
                .login(&Credentials::new(email, password))
                .await
                .context("failed to log in")?;
            eprintln!("{}", console::style("Logged in.").green());
        }
        Command::Logout => {
            client.logout();
            eprintln!("Logged out.");
        }
        Command::Status { validate } => {
            let tokens = client.tokens();
            output::print_status(tokens.status(), tokens.expires_at());
            if validate {
                let accepted = tokens.is_authenticated() && tokens.validate_token().await;
                println!("Accepted by the API: {}", if accepted { "yes" } else { "no" });
            }
        }
        Command::Get {
            path,
            params,
            no_cache,
        } => {
            let mut request = ApiRequest::get(path).params(params);
            if no_cache {
                request = request.no_cache();
            }
            let response = client.send(request).await.context("request failed")?;
            output::print_response(&response)?;
        }
        Command::Send { method, path, data } => {
            let mut request = ApiRequest::new(method, path);
            if let Some(data) = data {
                let body: Value = serde_json::from_str(&data).context("invalid JSON body")?;
                if !method.is_mutating() {
                    bail!("{method} requests cannot carry a body");
                }
                request = request.json(body);
            }
            let response = client.send(request).await.context("request failed")?;
            output::print_response(&response)?;
        }
        Command::List { resource, params } => {
            let items = client
                .resource(resource)
                .list(params)
                .await
                .with_context(|| format!("failed to list {resource}"))?;
            output::print_json(&items)?;
        }
        Command::Show { resource, id } => {
            let item = client
                .resource(resource)
                .get(&id)
                .await
                .with_context(|| format!("failed to fetch {}", resource.item_path(&id)))?;
            output::print_json(&item)?;
        }
        Command::Resources => {
            for resource in Resource::ALL {
                println!("{resource}");
            }
        }
    }

    Ok(())
}

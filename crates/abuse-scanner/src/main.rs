use std::process::ExitCode;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use abuse_scanner::accounts::AccountsClient;
use abuse_scanner::config::Config;
use abuse_scanner::db::{self, LockClient};
use abuse_scanner::email::blocker::Blocker;
use abuse_scanner::email::fetcher::Fetcher;
use abuse_scanner::email::finalizer::Finalizer;
use abuse_scanner::email::ncmec::NcmecClient;
use abuse_scanner::email::parser::Parser;
use abuse_scanner::email::reporter::Reporter;
use abuse_scanner::worker::WorkerHandle;

#[tokio::main]
async fn main() -> ExitCode {
    // load a .env when present, the environment itself wins
    let _ = dotenvy::dotenv();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Failed to load configuration: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_new(&config.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let db = match db::init_database(&config.database_url).await {
        Ok(db) => db,
        Err(err) => {
            error!("Failed to initialize database client, err: {}", err);
            return ExitCode::FAILURE;
        }
    };

    let locks = LockClient::new(db.clone(), config.server_domain.clone());
    let http = reqwest::Client::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles: Vec<WorkerHandle> = Vec::new();

    // the fetcher downloads the emails
    info!("Initializing email fetcher...");
    let fetcher = Arc::new(Fetcher::new(
        db.clone(),
        locks.clone(),
        config.mail.clone(),
        config.mailbox.clone(),
        config.server_domain.clone(),
    ));
    handles.push(fetcher.start(shutdown_rx.clone()));

    // the parser extracts skylinks and tags out of every downloaded email
    info!("Initializing email parser...");
    let parser = Arc::new(Parser::new(
        db.clone(),
        locks.clone(),
        config.server_domain.clone(),
        config.sponsor.clone(),
    ));
    handles.push(parser.start(shutdown_rx.clone()));

    // the blocker submits parsed skylinks to the blocker API
    info!("Initializing blocker...");
    let blocker = Arc::new(Blocker::new(
        db.clone(),
        locks.clone(),
        config.blocker_api_url.clone(),
        config.server_domain.clone(),
        http.clone(),
    ));
    handles.push(blocker.start(shutdown_rx.clone()));

    // the finalizer replies to handled emails with a summary of what was
    // found and blocked
    info!("Initializing finalizer...");
    let finalizer = match Finalizer::new(
        db.clone(),
        locks.clone(),
        config.mail.clone(),
        config.abuse_mailaddress.clone(),
        config.mailbox.clone(),
        config.server_domain.clone(),
        config.ncmec.is_some(),
    ) {
        Ok(finalizer) => Arc::new(finalizer),
        Err(err) => {
            error!("Failed to initialize finalizer, err: {}", err);
            return ExitCode::FAILURE;
        }
    };
    handles.push(finalizer.start(shutdown_rx.clone()));

    // the reporter files csam emails with NCMEC, when enabled
    if let Some(ncmec) = &config.ncmec {
        info!("Initializing reporter...");
        let accounts = Arc::new(AccountsClient::new(
            config.accounts_api_url.clone(),
            http.clone(),
        ));
        let authority = Arc::new(NcmecClient::new(&ncmec.credentials, http.clone()));
        let reporter = Arc::new(Reporter::new(
            db.clone(),
            locks.clone(),
            accounts,
            authority,
            &ncmec.credentials,
            config.portal_url.clone(),
            ncmec.reporter.clone(),
        ));
        match reporter.start(shutdown_rx.clone()).await {
            Ok(reporter_handles) => handles.extend(reporter_handles),
            Err(err) => {
                error!("Failed to start the NCMEC reporter, err: {}", err);
                return ExitCode::FAILURE;
            }
        }
    }

    // wait for an exit signal
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal, err: {}", err);
    }

    // signal all components and join them under the shutdown deadline
    info!("Shutting down...");
    let _ = shutdown_tx.send(true);

    let mut clean = true;
    for handle in handles {
        if let Err(err) = handle.stop().await {
            error!("{}", err);
            clean = false;
        }
    }

    info!("Abuse Scanner Terminated.");
    if clean {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

mod config;

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use warden_fc::autodetect::{autodetect, default_candidate_bauds, default_candidate_devs, with_system_ports};
use warden_fc::params::{fetch_params, DUMP_IDLE, DUMP_WINDOW};
use warden_fc::{ConnectionLost, Connector, Endpoint, FcConfig, MavConnector, Supervisor};
use warden_ft::{TerminationEngine, Trigger};
use warden_mission::MissionUploader;
use warden_proto::command::Reply;
use warden_server::{CommandServer, Dispatcher, FlightHandler};

use crate::config::{load_config, Config};

#[derive(Debug, Parser)]
#[command(name = "warden", version, about = "warden - flight controller link supervisor and flight termination")]
struct Cli {
    #[arg(long)]
    config: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the config file.
    Doctor,
    /// Supervise the link, serve the command socket and terminate on link loss.
    Run,
    Fc {
        #[command(subcommand)]
        cmd: FcCmd,
    },
    /// Send one command to a running warden and print the reply.
    Send {
        #[arg(required = true, trailing_var_arg = true)]
        text: Vec<String>,
    },
}

#[derive(Debug, Subcommand)]
enum FcCmd {
    /// Probe serial ports/bauds for MAVLink heartbeats.
    Autodetect,
    /// Dump the flight controller parameters.
    Params,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let cfg = match load_config(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let res = match cli.cmd {
        Command::Doctor => doctor(&cfg).map(|()| ExitCode::SUCCESS),
        Command::Run => run(&cfg).await,
        Command::Fc { cmd } => fc_cmd(&cfg, cmd).await.map(|()| ExitCode::SUCCESS),
        Command::Send { text } => send(&cfg, &text.join(" ")).await,
    };
    match res {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");
    config::check(cfg)?;
    if cfg.fc.autodetect {
        info!("doctor: fc autodetect enabled (OK)");
    }
    info!("doctor: OK");
    Ok(())
}

async fn fc_cmd(cfg: &Config, cmd: FcCmd) -> Result<()> {
    match cmd {
        FcCmd::Autodetect => {
            let res = run_autodetect(&cfg.fc).await;
            match &res.chosen {
                Some(ep) => println!("CHOSEN: {}", ep),
                None => println!("CHOSEN: none"),
            }
            for p in res.probes {
                println!("probe dev={} baud={} hb={} {}ms note={}", p.dev, p.baud, p.hb_seen, p.elapsed_ms, p.note);
            }
            Ok(())
        }
        FcCmd::Params => {
            let supervisor = connect(&cfg.fc).await?;
            let params = fetch_params(&supervisor.current(), DUMP_WINDOW, DUMP_IDLE).await.context("parameter dump")?;
            for p in &params {
                println!("{} {}", p.name, p.value);
            }
            info!("{} parameters", params.len());
            supervisor.current().close();
            Ok(())
        }
    }
}

async fn run_autodetect(fc: &FcConfig) -> warden_fc::autodetect::AutodetectResult {
    let devs = with_system_ports(fc.candidate_devs.clone().unwrap_or_else(default_candidate_devs));
    let bauds = fc.candidate_bauds.clone().unwrap_or_else(default_candidate_bauds);
    autodetect(Arc::new(MavConnector), devs, bauds, fc.kind, fc.probe_timeout()).await
}

async fn resolve_endpoint(fc: &FcConfig) -> Result<Endpoint> {
    if fc.autodetect {
        info!("fc: autodetect enabled");
        let res = run_autodetect(fc).await;
        return res.chosen.context("fc autodetect found no flight controller");
    }
    fc.endpoint().context("fc.endpoint")
}

async fn connect(fc: &FcConfig) -> Result<Supervisor> {
    let endpoint = resolve_endpoint(fc).await?;
    let connector: Arc<dyn Connector> = Arc::new(MavConnector);
    Supervisor::connect(fc.supervisor_config(endpoint), connector)
        .await
        .context("connect to flight controller")
}

async fn run(cfg: &Config) -> Result<ExitCode> {
    info!("run: starting");
    let supervisor = Arc::new(connect(&cfg.fc).await?);
    let engine = Arc::new(TerminationEngine::new(cfg.termination.engine_config()));
    engine.monitor();

    let (tx, rx) = warden_server::channel(cfg.server.queue_capacity);
    let server = CommandServer::bind(&cfg.server, tx).context("bind command socket")?;
    let handler = FlightHandler::new(
        supervisor.clone(),
        engine.clone(),
        MissionUploader::new(cfg.mission.upload_config()),
        engine.config().ack_timeout,
    );
    let server_task = tokio::spawn(server.serve());
    let dispatcher_task = tokio::spawn(Dispatcher::new(rx, Arc::new(handler)).run());

    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    let link = async {
        loop {
            let lost = supervisor.run().await;
            on_connection_lost(&supervisor, &engine, lost).await;
        }
    };

    let code = tokio::select! {
        _ = link => ExitCode::SUCCESS,
        r = tokio::signal::ctrl_c() => {
            if let Err(e) = r {
                error!("ctrl-c handler: {}", e);
            }
            warn!("interrupted");
            ExitCode::FAILURE
        }
        _ = sigterm.recv() => {
            info!("SIGTERM, shutting down");
            ExitCode::SUCCESS
        }
    };

    // dropping the server removes the socket file
    server_task.abort();
    let _ = server_task.await;
    dispatcher_task.abort();
    supervisor.current().close();
    info!("run: stopped (termination state {:?})", engine.state());
    Ok(code)
}

/// Runs the termination engine for a lost link, then keeps trying to get the
/// link back. An action that failed on the dead link is retried on the new one
/// and the engine goes back to monitoring unless it terminated. The companion
/// heartbeat keeps running throughout.
async fn on_connection_lost(supervisor: &Supervisor, engine: &TerminationEngine, lost: ConnectionLost) {
    error!("{:#}", anyhow::Error::new(lost));
    match engine.execute(&supervisor.current(), Trigger::ConnectionLost).await {
        Ok(Some(action)) => info!("flight termination complete: {:?}", action),
        Ok(None) => info!("flight termination already complete"),
        Err(e) => error!("flight termination failed: {}", e),
    }

    loop {
        tokio::time::sleep(supervisor.config().retry_delay).await;
        match supervisor.reconnect().await {
            Ok(session) => {
                info!("link restored");
                match engine.link_restored(&session).await {
                    Ok(Some(action)) => info!("flight termination complete: {:?}", action),
                    Ok(None) => {}
                    Err(e) => error!("flight termination failed again: {}", e),
                }
                return;
            }
            Err(e) => warn!("link still down: {}", e),
        }
    }
}

async fn send(cfg: &Config, text: &str) -> Result<ExitCode> {
    let path = &cfg.server.socket_path;
    let stream = UnixStream::connect(path)
        .await
        .with_context(|| format!("connect {}", path.display()))?;
    let (rd, mut wr) = stream.into_split();
    // literal "\n" lets inline mission plans be typed on one line
    wr.write_all(text.replace("\\n", "\n").as_bytes()).await.context("send command")?;
    wr.shutdown().await.context("send command")?;

    let mut line = String::new();
    BufReader::new(rd).read_line(&mut line).await.context("read reply")?;
    let reply = Reply::parse_line(&line).context("no reply from warden")?;
    println!("{}", line.trim_end());
    Ok(if reply.is_ok() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

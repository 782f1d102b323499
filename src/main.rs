use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use queue_relay::config::{self, RelayConfig, DEFAULT_CONFIG_FILE};
use queue_relay::error::ToEnhanced;
use queue_relay::queue::QueueView;
use queue_relay::storage::{self, SnapshotStore};
use queue_relay::{logging, server};
use queue_relay::{AgentOptions, ConnectionStatus, DoctorId, PatientId, PatientQueue, QueueStore, Role, SyncAgent};

#[derive(Parser)]
#[command(name = "queue-relay")]
#[command(about = "Clinic patient-queue broadcaster: relay hub and sync agents", version)]
#[command(after_help = "Surfaces:
- receptionist   add patients to either doctor's lane
- doctor         call (remove) patients from their own lane
- display        read-only waiting-room board
- queue-manager  add, remove, reorder and transfer patients

Run `queue-relay serve` on one machine, then `queue-relay agent --server <host:port>` on every surface.")]
struct Cli {
    /// Config file
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the relay hub
    Serve {
        #[arg(short, long)]
        port: Option<u16>,

        /// Only relay lanes for this many doctors (1 or 2)
        #[arg(long)]
        doctor_count: Option<u8>,

        /// Serve surface pages from this directory
        #[arg(long)]
        static_dir: Option<PathBuf>,
    },

    /// Run a sync agent with an interactive queue console
    Agent {
        #[arg(short, long)]
        role: Option<Role>,

        /// Doctor lane this surface belongs to
        #[arg(short, long)]
        doctor: Option<String>,

        /// Hub address, e.g. 192.168.1.11:8080
        #[arg(short, long)]
        server: Option<String>,
    },

    /// Print the locally persisted queue
    Show,

    /// Manage the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Write a default config file
    Init,
    /// Print the effective configuration
    Show,
    /// Restore defaults
    Reset,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let _guard = match logging::init(cli.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("{} {:#}", "✗".red(), e);
            None
        }
    };

    if let Err(e) = run(cli).await.enhance() {
        eprintln!("{}", e.display().red());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Config { action } => config_command(&cli.config, action),

        Commands::Serve {
            port,
            doctor_count,
            static_dir,
        } => {
            let mut config = RelayConfig::load(&cli.config)?;
            if let Some(port) = port {
                config.port = port;
            }
            if doctor_count.is_some() {
                config.doctor_count = doctor_count;
            }
            if static_dir.is_some() {
                config.static_dir = static_dir;
            }
            config.validate()?;

            println!("{}", format!("🌐 Starting relay hub on port {}...", config.port).cyan().bold());
            server::start(&config).await
        }

        Commands::Agent { role, doctor, server } => {
            let mut config = RelayConfig::load(&cli.config)?;
            if let Some(role) = role {
                config.role = role;
            }
            if let Some(doctor) = doctor {
                config.doctor_id = DoctorId::new(doctor);
            }
            if let Some(server) = server {
                config::validate_server_url(&server)?;
                config.server_url = server;
            }
            run_agent(config).await
        }

        Commands::Show => {
            let config = RelayConfig::load(&cli.config)?;
            let snapshots = SnapshotStore::new(storage::init(&config.data_dir)?);
            let queue = PatientQueue::from_snapshot(snapshots.load());
            print_view(&queue.view(Role::Display, &config.doctor_id, &config.lanes(), config.max_displayed()));
            Ok(())
        }
    }
}

fn config_command(path: &std::path::Path, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Init => {
            if path.exists() {
                bail!("config file {} already exists", path.display());
            }
            RelayConfig::default().save(path)?;
            println!("{} Wrote {}", "✓".green(), path.display().to_string().bright_white());
        }
        ConfigAction::Show => {
            let config = RelayConfig::load(path)?;
            let text = toml::to_string_pretty(&config).context("failed to render config")?;
            println!("{}", format!("# {}", path.display()).bright_black());
            println!("{text}");
        }
        ConfigAction::Reset => {
            RelayConfig::reset(path)?;
            println!("{} Restored defaults in {}", "✓".green(), path.display().to_string().bright_white());
        }
    }
    Ok(())
}

async fn run_agent(config: RelayConfig) -> Result<()> {
    config::validate_server_url(&config.server_url)?;

    let store = Arc::new(QueueStore::open(SnapshotStore::new(storage::init(&config.data_dir)?)));
    let agent = SyncAgent::new(AgentOptions::from_config(&config), store.clone());

    let board = Board {
        role: config.role,
        doctor: config.doctor_id.clone(),
        lanes: config.lanes(),
        max_items: config.max_displayed(),
    };

    {
        let board = board.clone();
        agent.on_update(move |patients| {
            println!("{}", "↻ Queue updated".bright_blue());
            board.print(&PatientQueue::from_snapshot(patients.to_vec()));
        });
    }

    let mut status_rx = agent.watch_status();
    tokio::spawn(async move {
        while status_rx.changed().await.is_ok() {
            let status = *status_rx.borrow_and_update();
            let label = match status {
                ConnectionStatus::Connected => "● connected".green(),
                ConnectionStatus::Connecting => "◌ connecting".yellow(),
                ConnectionStatus::Disconnected => "○ disconnected".bright_black(),
                ConnectionStatus::Error => "✗ error, retrying after cooldown".red(),
            };
            println!("{label}");
        }
    });

    println!(
        "{} {} surface for {}, hub {}",
        "▶".cyan(),
        config.role.to_string().bright_yellow(),
        config.doctor_id.to_string().bright_white(),
        config.websocket_url().bright_blue()
    );
    board.print(&store.queue());
    if config.role.is_read_only() {
        println!("{}", "Read-only board: only list, status, reconnect and server are available".bright_black());
    }
    print_help();

    let handle = agent.start();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "quit" | "exit") {
            break;
        }
        match console_command(line, &agent, &board) {
            Ok(()) => {}
            Err(e) => println!("{} {:#}", "✗".red(), e),
        }
    }

    agent.stop();
    let _ = handle.await;
    Ok(())
}

#[derive(Clone)]
struct Board {
    role: Role,
    doctor: DoctorId,
    lanes: Vec<DoctorId>,
    max_items: usize,
}

impl Board {
    fn print(&self, queue: &PatientQueue) {
        print_view(&queue.view(self.role, &self.doctor, &self.lanes, self.max_items));
    }

    /// `<lane>` is `1`, `2` or a doctor id; doctors default to their own lane.
    fn lane(&self, arg: Option<&str>) -> Result<DoctorId> {
        match arg {
            Some("1") => Ok(DoctorId::primary()),
            Some("2") => Ok(DoctorId::secondary()),
            Some(other) => Ok(DoctorId::new(other)),
            None if self.role == Role::Doctor => Ok(self.doctor.clone()),
            None => bail!("invalid command: lane required (1 or 2)"),
        }
    }

    /// Resolve `<n> [lane]` (1-based place in the lane) to a patient.
    fn patient(&self, queue: &PatientQueue, args: &[&str]) -> Result<PatientId> {
        let n: usize = args
            .first()
            .context("invalid command: patient number required")?
            .parse()
            .context("invalid patient number")?;
        let doctor = self.lane(args.get(1).copied())?;
        queue
            .lane(&doctor)
            .get(n.wrapping_sub(1))
            .map(|p| p.id.clone())
            .with_context(|| format!("invalid patient number {n} for {doctor}"))
    }
}

fn require(allowed: bool, role: Role, action: &str) -> Result<()> {
    if !allowed {
        bail!("{action} is not permitted for the {role} surface");
    }
    Ok(())
}

fn console_command(line: &str, agent: &SyncAgent, board: &Board) -> Result<()> {
    let store = agent.store();
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default();
    let args: Vec<&str> = parts.collect();
    let role = board.role;

    match command {
        "add" => {
            require(role.can_add(), role, "adding patients")?;
            let (name, lane) = match args.split_last() {
                Some((last, rest)) if !rest.is_empty() && matches!(*last, "1" | "2") => {
                    (rest.join(" "), Some(*last))
                }
                _ => (args.join(" "), None),
            };
            let doctor = match lane {
                Some(lane) => board.lane(Some(lane))?,
                None => board.doctor.clone(),
            };
            store.add_patient(&name, doctor.clone())?;
            println!("{} Added {} to {}", "✓".green(), name.bright_white(), doctor);
        }
        "remove" | "next" => {
            require(role.can_remove(), role, "removing patients")?;
            let id = board.patient(&store.queue(), &args)?;
            if let Some(p) = store.remove_patient(&id) {
                println!("{} Called {}", "✓".green(), p.patient_name.bright_white());
            }
        }
        "up" | "down" => {
            require(role.can_reorder(), role, "reordering")?;
            let id = board.patient(&store.queue(), &args)?;
            let moved = if command == "up" { store.move_up(&id) } else { store.move_down(&id) };
            if !moved {
                println!("{} Already at the {} of the lane", "•".bright_black(), if command == "up" { "front" } else { "back" });
            }
        }
        "transfer" => {
            require(role.can_reorder(), role, "transferring")?;
            let id = board.patient(&store.queue(), &args)?;
            if let Some(to) = store.transfer(&id) {
                println!("{} Transferred to {}", "✓".green(), to);
            }
        }
        "clear" => {
            require(role.can_remove(), role, "clearing")?;
            let lane = match args.first() {
                Some(&"all") => None,
                other => Some(board.lane(other.copied())?),
            };
            let removed = store.clear(lane.as_ref());
            println!("{} Cleared {} patient(s)", "✓".green(), removed);
        }
        "list" => board.print(&store.queue()),
        "status" => println!("{}", agent.status()),
        "reconnect" => agent.reconnect(),
        "server" => {
            let url = args.first().context("invalid command: server address required")?;
            config::validate_server_url(url)?;
            agent.set_server_url(*url);
        }
        "help" => print_help(),
        other => bail!("invalid command '{other}' (try help)"),
    }
    Ok(())
}

fn print_help() {
    println!("{}", "Commands:".yellow());
    println!("  {}   add a patient", "add <name> [lane]".bright_white());
    println!("  {}       call the n-th patient", "remove <n> [lane]".bright_white());
    println!("  {}   reorder within a lane", "up|down <n> [lane]".bright_white());
    println!("  {}     move to the other doctor", "transfer <n> [lane]".bright_white());
    println!("  {}      clear a lane or everything", "clear [lane|all]".bright_white());
    println!("  {}", "list | status | reconnect | server <host:port> | quit".bright_white());
}

fn print_view(view: &QueueView) {
    for lane in &view.lanes {
        println!(
            "{} {}",
            lane.doctor.to_string().cyan().bold(),
            format!("({} waiting)", lane.waiting).bright_black()
        );
        if lane.patients.is_empty() {
            println!("   {}", "no patients".bright_black());
        }
        for (i, p) in lane.patients.iter().enumerate() {
            println!("   {:>2}. {}", i + 1, p.patient_name.bright_white());
        }
    }
}

// rollcall: attendance beacon CLI
//
// Officers open sessions, members record attendance, and `simulate` runs a
// whole room of devices in-process. Sessions live in a local sled database.

mod ble;
mod config;
mod logging;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use config::CliConfig;
use rollcall_core::token::{estimate_entropy, validate_format, MIN_TOKEN_ENTROPY_BITS};
use rollcall_core::{
    generate_token, hash_token, AttendanceDelegate, AttendanceStatus, AttendanceSubmitter,
    BroadcastState, Caller, Clock, CreateSessionRequest, Datastore, DetectedSession,
    LocalDatastore, MemoryStorage, ProximityConfig, ProximityNode, RadioState, SessionInfo,
    SimulatedAir, SledStorage, StaticIdentity, SubmitError, SubmitOutcome, SystemClock, Token,
    TokenHash,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "rollcall")]
#[command(about = "Rollcall: proximity attendance over BLE beacons", long_about = None)]
#[command(version)]
struct Cli {
    /// Debug-level logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Also write daily-rotated JSON logs to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and inspect session tokens
    Token {
        #[command(subcommand)]
        action: TokenAction,
    },
    /// Manage attendance sessions
    Session {
        #[command(subcommand)]
        action: SessionAction,
    },
    /// Record attendance with a session token (manual fallback)
    Attend { token: String },
    /// Listen for attendance beacons with this machine's Bluetooth adapter
    Scan {
        /// Organization to attend as
        #[arg(short, long)]
        org: Option<String>,
        /// Seconds to listen before stopping
        #[arg(short, long, default_value = "60")]
        duration: u64,
    },
    /// Run an officer and several members on a simulated radio
    Simulate {
        #[arg(short, long, default_value = "3")]
        members: usize,
        /// Advertisement rounds to propagate
        #[arg(short, long, default_value = "5")]
        rounds: usize,
    },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum TokenAction {
    Generate {
        #[arg(short, long, default_value = "1")]
        count: usize,
    },
    /// Beacon hash of any string
    Hash { token: String },
    /// Check a token's format and entropy
    Check { token: String },
}

#[derive(Subcommand)]
enum SessionAction {
    Create {
        #[arg(short, long)]
        org: String,
        #[arg(short, long)]
        title: String,
        /// Lifetime in seconds
        #[arg(long, default_value = "3600")]
        ttl: u64,
        /// Delay before the session opens, in seconds
        #[arg(long)]
        starts_in: Option<u64>,
    },
    /// Active sessions of an organization
    List {
        #[arg(short, long)]
        org: String,
    },
    Show { token: String },
    End { token: String },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    /// Add an organization membership and its beacon code
    Join { org: String, code: u16 },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.verbose, cli.log_dir.as_deref())?;

    match cli.command {
        Commands::Token { action } => cmd_token(action),
        Commands::Session { action } => cmd_session(action).await,
        Commands::Attend { token } => cmd_attend(token).await,
        Commands::Scan { org, duration } => cmd_scan(org, duration).await,
        Commands::Simulate { members, rounds } => cmd_simulate(members, rounds).await.map(|_| ()),
        Commands::Config { action } => cmd_config(action),
    }
}

// ============================================================================
// COMMANDS
// ============================================================================

fn cmd_token(action: TokenAction) -> Result<()> {
    match action {
        TokenAction::Generate { count } => {
            for _ in 0..count.max(1) {
                let token = generate_token()?;
                println!("{}  {}", token.as_str().bright_cyan(), token.hash());
            }
        }
        TokenAction::Hash { token } => {
            let hash = hash_token(&token);
            println!("{} ({})", hash, hash.value());
        }
        TokenAction::Check { token } => {
            let entropy = estimate_entropy(&token);
            let format_ok = validate_format(&token);
            let entropy_ok = entropy >= MIN_TOKEN_ENTROPY_BITS;

            println!("{}", "Token Check".bold());
            println!("  Format:  {}", mark(format_ok));
            println!(
                "  Entropy: {} {:.1} bits (minimum {:.0})",
                mark(entropy_ok),
                entropy,
                MIN_TOKEN_ENTROPY_BITS
            );
            println!("  Hash:    {}", hash_token(&token));

            if let Err(e) = Token::parse(&token) {
                println!();
                println!("{} {}", "✗".red(), e);
            }
        }
    }
    Ok(())
}

async fn cmd_session(action: SessionAction) -> Result<()> {
    let config = CliConfig::load()?;
    let caller = config.caller()?;
    let store = open_datastore(&config)?;

    match action {
        SessionAction::Create {
            org,
            title,
            ttl,
            starts_in,
        } => {
            let starts_at = starts_in.map(|delay| SystemClock.now_secs() + delay);
            let created = store
                .create_session(
                    &caller,
                    CreateSessionRequest {
                        organization_id: org,
                        title,
                        starts_at,
                        ttl_seconds: ttl,
                    },
                )
                .await
                .context("Failed to create session")?;

            println!("{} Session created", "✓".green());
            println!("  Token:   {}", created.token.bright_cyan().bold());
            println!("  Beacon:  {}", hash_token(&created.token));
            println!("  Expires: {}", format_timestamp(created.expires_at));
        }
        SessionAction::List { org } => {
            let sessions = store.list_active_sessions(&caller, &org).await?;
            if sessions.is_empty() {
                println!("{}", "No active sessions.".dimmed());
                return Ok(());
            }

            println!("{} ({} active)", "Sessions".bold(), sessions.len());
            println!();
            let now = SystemClock.now_secs();
            for session in sessions {
                println!(
                    "  {} {} {}",
                    "•".bright_green(),
                    session.token.bright_cyan(),
                    session.event_title
                );
                println!(
                    "    {} left, beacon {}",
                    format_duration(session.remaining_secs(now)),
                    hash_token(&session.token)
                );
            }
        }
        SessionAction::Show { token } => {
            let session = store.resolve_session(&caller, &token).await?;
            let records = store.attendance_for_session(&session.token)?;

            print_session(&session);
            println!();
            if records.is_empty() {
                println!("{}", "No attendance yet.".dimmed());
            } else {
                println!("{} ({})", "Attendance".bold(), records.len());
                for record in records {
                    println!(
                        "  {} {:<20} {}",
                        "✓".green(),
                        record.member_id.bright_cyan(),
                        format_timestamp(record.recorded_at).dimmed()
                    );
                }
            }
        }
        SessionAction::End { token } => {
            store.terminate_session(&caller, &token).await?;
            println!("{} Session {} ended", "✓".green(), token.to_uppercase().bright_cyan());
        }
    }
    Ok(())
}

async fn cmd_attend(token: String) -> Result<()> {
    let config = CliConfig::load()?;
    let caller = config.caller()?;
    let store: Arc<dyn Datastore> = Arc::new(open_datastore(&config)?);
    let submitter =
        AttendanceSubmitter::new(store, Arc::new(StaticIdentity::new(caller)), &config.proximity);

    match submitter.submit(&token).await {
        Ok(SubmitOutcome::Recorded { attendance_id }) => {
            println!("{} Attendance recorded", "✓".green());
            println!("  Receipt: {}", attendance_id.dimmed());
        }
        Ok(SubmitOutcome::AlreadyRecorded) => {
            println!("{} Already marked present", "✓".green());
        }
        Ok(SubmitOutcome::Suppressed) => {
            println!("{}", "Submission already in progress.".dimmed());
        }
        Err(e) => anyhow::bail!("{}", explain_submit_error(&e)),
    }
    Ok(())
}

async fn cmd_scan(org: Option<String>, duration: u64) -> Result<()> {
    let config = CliConfig::load()?;
    let caller = config.caller()?;
    let store = Arc::new(open_datastore(&config)?);
    let radio = Arc::new(ble::BleRadio::first_adapter().await?);

    let node = ProximityNode::new(
        config.proximity.clone(),
        radio,
        store,
        Arc::new(StaticIdentity::new(caller)),
    )?;
    node.set_delegate(Some(Arc::new(ConsoleDelegate::new("scan"))));

    if node.radio_state() != RadioState::PoweredOn {
        anyhow::bail!("Bluetooth is not available (state: {})", node.radio_state());
    }

    node.start_scanning(org.as_deref()).await?;
    println!(
        "{} Listening for {}s (Ctrl-C to stop)",
        "✓".green(),
        duration
    );
    if org.is_none() {
        println!(
            "  {}",
            "No organization given; beacons are held until one is selected.".dimmed()
        );
    }

    tokio::select! {
        _ = tokio::time::sleep(Duration::from_secs(duration)) => {}
        _ = tokio::signal::ctrl_c() => println!(),
    }

    node.shutdown().await;
    let detected = node.scan().detected_sessions();
    println!();
    println!("{} ({} detected)", "Summary".bold(), detected.len());
    for d in detected {
        println!(
            "  {} {}",
            status_mark(&d.status),
            d.session.event_title.bright_cyan()
        );
    }
    Ok(())
}

/// Returns how many members ended up present
async fn cmd_simulate(members: usize, rounds: usize) -> Result<usize> {
    const ORG: &str = "demo-org";
    const ORG_CODE: u16 = 1;

    let air = SimulatedAir::new();
    let store = Arc::new(LocalDatastore::new(MemoryStorage::new()));
    let config = ProximityConfig::default();

    println!("{}", "Rollcall simulation".bold());
    println!();

    let officer = ProximityNode::new(
        config.clone(),
        air.attach("officer", -40),
        store.clone(),
        Arc::new(StaticIdentity::new(
            Caller::new("officer").with_membership(ORG, ORG_CODE),
        )),
    )?;
    officer.set_delegate(Some(Arc::new(ConsoleDelegate::new("officer"))));

    let session = officer
        .open_session(CreateSessionRequest {
            organization_id: ORG.to_string(),
            title: "Simulated meeting".to_string(),
            starts_at: None,
            ttl_seconds: 600,
        })
        .await?;
    print_session(&session);
    println!();

    let mut scanners = Vec::with_capacity(members);
    for i in 0..members {
        let name = format!("member-{}", i + 1);
        let rssi = -50 - 5 * i as i16;
        let node = ProximityNode::new(
            config.clone(),
            air.attach(name.clone(), rssi),
            store.clone(),
            Arc::new(StaticIdentity::new(
                Caller::new(name.clone()).with_membership(ORG, ORG_CODE),
            )),
        )?;
        node.set_delegate(Some(Arc::new(ConsoleDelegate::new(&name))));
        node.start_scanning(Some(ORG)).await?;
        scanners.push(node);
    }

    for _ in 0..rounds {
        air.propagate();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    let records = store.attendance_for_session(&session.token)?;
    println!();
    println!(
        "{} {}/{} members present",
        "Result:".bold(),
        records.len(),
        members
    );

    officer.close_session(&session.token).await?;
    for node in &scanners {
        node.shutdown().await;
    }
    Ok(records.len())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = CliConfig::load()?;

    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} Set {} = {}", "✓".green(), key.bright_cyan(), value);
        }
        ConfigAction::Get { key } => match config.get(&key) {
            Some(value) => println!("{} = {}", key.bright_cyan(), value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },
        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            println!();
            for (key, value) in config.list() {
                println!("  {:<28} {}", key.bright_cyan(), value);
            }

            println!();
            println!("{}", "Memberships:".bold());
            if config.memberships.is_empty() {
                println!("  {}", "(none)".dimmed());
            }
            for m in &config.memberships {
                println!("  {} (code {})", m.organization_id, m.organization_code);
            }
        }
        ConfigAction::Join { org, code } => {
            config.join(&org, code)?;
            config.save()?;
            println!(
                "{} Joined {} (beacon code {})",
                "✓".green(),
                org.bright_cyan(),
                code
            );
        }
    }
    Ok(())
}

// ============================================================================
// CONSOLE OUTPUT
// ============================================================================

struct ConsoleDelegate {
    label: String,
}

impl ConsoleDelegate {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
        }
    }
}

impl AttendanceDelegate for ConsoleDelegate {
    fn on_session_detected(&self, detected: DetectedSession) {
        println!(
            "  {} [{}] detected {} ({} dBm)",
            "◉".bright_cyan(),
            self.label,
            detected.session.event_title.bright_cyan(),
            detected.signal_strength
        );
        if detected.status == AttendanceStatus::AwaitingConfirmation {
            println!(
                "    confirm with: {}",
                format!("rollcall attend {}", detected.session.token).bright_green()
            );
        }
    }

    fn on_attendance_result(
        &self,
        session: SessionInfo,
        result: Result<SubmitOutcome, SubmitError>,
    ) {
        match result {
            Ok(SubmitOutcome::Recorded { .. }) => println!(
                "  {} [{}] present at {}",
                "✓".green(),
                self.label,
                session.event_title
            ),
            Ok(SubmitOutcome::AlreadyRecorded) => println!(
                "  {} [{}] already present at {}",
                "✓".green(),
                self.label,
                session.event_title
            ),
            Ok(SubmitOutcome::Suppressed) => {}
            Err(e) => println!(
                "  {} [{}] {}",
                "✗".red(),
                self.label,
                explain_submit_error(&e)
            ),
        }
    }

    fn on_ambiguous_beacon(
        &self,
        organization_code: u16,
        token_hash: TokenHash,
        candidates: Vec<SessionInfo>,
    ) {
        println!(
            "  {} [{}] beacon {} in org {} matches {} sessions; attend by token instead:",
            "⚠".yellow(),
            self.label,
            token_hash,
            organization_code,
            candidates.len()
        );
        for session in candidates {
            println!("    {}", session.event_title);
        }
    }

    fn on_broadcast_state_changed(&self, state: BroadcastState) {
        match state {
            BroadcastState::Advertising => {
                println!("  {} [{}] advertising", "📡".bright_green(), self.label)
            }
            BroadcastState::Failed(e) => {
                println!("  {} [{}] broadcast failed: {}", "✗".red(), self.label, e)
            }
            _ => {}
        }
    }

    fn on_radio_state_changed(&self, state: RadioState) {
        if state != RadioState::PoweredOn {
            println!("  {} [{}] radio is {}", "⚠".yellow(), self.label, state);
        }
    }
}

fn print_session(session: &SessionInfo) {
    println!("{}", session.event_title.bold());
    println!("  Token:        {}", session.token.bright_cyan());
    println!("  Organization: {}", session.organization_id);
    println!("  Beacon:       {}", hash_token(&session.token));
    println!("  Opens:        {}", format_timestamp(session.starts_at));
    println!("  Closes:       {}", format_timestamp(session.ends_at));
}

fn explain_submit_error(err: &SubmitError) -> String {
    match err {
        SubmitError::SessionExpired => "This session has ended.".to_string(),
        SubmitError::InvalidToken => "No session matches that token.".to_string(),
        SubmitError::OrganizationMismatch => {
            "You are not a member of this session's organization.".to_string()
        }
        SubmitError::Unauthenticated => {
            "Not signed in. Run `rollcall config set member_id <id>`.".to_string()
        }
        SubmitError::Network(detail) => format!("Could not reach the datastore: {}", detail),
    }
}

fn status_mark(status: &AttendanceStatus) -> ColoredString {
    match status {
        AttendanceStatus::Present => "✓".green(),
        AttendanceStatus::Failed(_) => "✗".red(),
        AttendanceStatus::AwaitingConfirmation | AttendanceStatus::Submitting => "…".yellow(),
    }
}

fn mark(ok: bool) -> ColoredString {
    if ok {
        "✓".green()
    } else {
        "✗".red()
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn open_datastore(config: &CliConfig) -> Result<LocalDatastore<SledStorage>> {
    let path = config.storage_path()?;
    let path = path
        .to_str()
        .context("Storage path is not valid UTF-8")?;
    let backend = SledStorage::open(path).context("Failed to open session database")?;
    Ok(LocalDatastore::new(backend).with_max_ttl(config.proximity.max_session_ttl_secs))
}

fn format_timestamp(timestamp: u64) -> String {
    use chrono::{DateTime, Local, Utc};

    let dt = DateTime::from_timestamp(timestamp as i64, 0).unwrap_or_else(Utc::now);
    let local: DateTime<Local> = dt.into();

    local.format("%Y-%m-%d %H:%M:%S").to_string()
}

fn format_duration(secs: u64) -> String {
    match secs {
        s if s >= 3600 => format!("{}h {:02}m", s / 3600, (s % 3600) / 60),
        s if s >= 60 => format!("{}m {:02}s", s / 60, s % 60),
        s => format!("{}s", s),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(5), "5s");
        assert_eq!(format_duration(125), "2m 05s");
        assert_eq!(format_duration(3660), "1h 01m");
    }

    #[test]
    fn test_explain_submit_error_mentions_config_for_sign_in() {
        assert!(explain_submit_error(&SubmitError::Unauthenticated).contains("member_id"));
        assert!(explain_submit_error(&SubmitError::Network("down".into())).contains("down"));
    }

    #[test]
    fn test_cli_parses_session_create() {
        let cli = Cli::try_parse_from([
            "rollcall", "session", "create", "--org", "org-b", "--title", "Weekly", "--ttl", "900",
        ])
        .unwrap();
        match cli.command {
            Commands::Session {
                action: SessionAction::Create { org, ttl, starts_in, .. },
            } => {
                assert_eq!(org, "org-b");
                assert_eq!(ttl, 900);
                assert!(starts_in.is_none());
            }
            _ => panic!("wrong command"),
        }
    }

    #[tokio::test]
    async fn test_simulation_records_every_member() {
        assert_eq!(cmd_simulate(3, 3).await.unwrap(), 3);
    }
}

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use portal::api::{AnnouncementDraft, AnnouncementQuery, DoctorNotes, HistoryQuery, PredictTarget};
use portal::config::ConfigError;
use portal::router::RouterError;
use portal::storage::StorageError;
use portal::{ApiError, Credentials, FileStorage, Notice, NoticeLevel, Notifier, Portal, PortalConfig};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;
use wire::Envelope;

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("session storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("{0}")]
    Api(#[from] ApiError),
    #[error("navigation failed: {0}")]
    Route(#[from] RouterError),
    #[error("file i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("no config directory; pass --session-file or set PORTAL_SESSION_FILE")]
    NoConfigDir,
    #[error("not signed in; run `portal-cli login` first")]
    NotSignedIn,
    #[error("{0}")]
    Usage(String),
    #[error("realtime channel is disabled for this profile; set PORTAL_REALTIME=1")]
    RealtimeDisabled,
}

#[derive(Parser, Debug)]
#[command(name = "portal-cli", about = "Tumor diagnosis portal client")]
struct Cli {
    /// Overrides PORTAL_API_BASE_URL.
    #[arg(long)]
    base_url: Option<String>,

    /// Where the session survives between invocations.
    #[arg(long, env = "PORTAL_SESSION_FILE")]
    session_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        username: String,
        #[arg(long, env = "PORTAL_PASSWORD", hide_env_values = true)]
        password: String,
    },
    Logout,
    /// Verify the stored session with the backend and print the user.
    Whoami,
    Health,
    Patient {
        id: Option<String>,
    },
    /// Upload a DICOM study.
    Upload {
        file: PathBuf,
    },
    /// Save the blank upload template.
    Template {
        #[arg(long, default_value = "template.xlsx")]
        output: PathBuf,
    },
    Predict(PredictArgs),
    /// Post an analysis payload (JSON object).
    Analyze {
        payload: String,
    },
    History {
        #[arg(long)]
        page: Option<u32>,
        #[arg(long)]
        per_page: Option<u32>,
        #[arg(long)]
        patient_id: Option<String>,
    },
    Record(RecordCommand),
    Statistics,
    Settings(SettingsCommand),
    Models(ModelsCommand),
    Announcements(AnnouncementsCommand),
    /// Run the navigation guard for a path against the stored session.
    Route {
        path: String,
    },
    /// Follow realtime prediction progress.
    Watch {
        /// Exit once a result or failure arrives.
        #[arg(long, default_value_t = false)]
        once: bool,
    },
}

#[derive(Args, Debug)]
struct PredictArgs {
    #[arg(long, required_unless_present = "image_url", conflicts_with = "image_url")]
    patient: Option<String>,
    #[arg(long)]
    image_url: Option<String>,
    /// Patient the image belongs to.
    #[arg(long, requires = "image_url")]
    patient_id: Option<String>,
}

#[derive(Args, Debug)]
struct RecordCommand {
    #[command(subcommand)]
    command: RecordSubcommand,
}

#[derive(Subcommand, Debug)]
enum RecordSubcommand {
    Show {
        id: i64,
    },
    /// Save the doctor's notes on a record.
    Notes {
        id: i64,
        #[arg(long)]
        diagnosis: Option<String>,
        #[arg(long)]
        suggestion: Option<String>,
        #[arg(long)]
        conclusion: Option<String>,
    },
}

#[derive(Args, Debug)]
struct SettingsCommand {
    #[command(subcommand)]
    command: SettingsSubcommand,
}

#[derive(Subcommand, Debug)]
enum SettingsSubcommand {
    Show {
        key: Option<String>,
    },
    /// Write one setting; the value is parsed as JSON, else kept as a string.
    Set {
        key: String,
        value: String,
        #[arg(long)]
        category: Option<String>,
    },
    Reset {
        #[arg(long)]
        category: Option<String>,
    },
}

#[derive(Args, Debug)]
struct ModelsCommand {
    #[command(subcommand)]
    command: ModelsSubcommand,
}

#[derive(Subcommand, Debug)]
enum ModelsSubcommand {
    List,
    Current,
    Switch { name: String },
    Delete { name: String },
}

#[derive(Args, Debug)]
struct AnnouncementsCommand {
    #[command(subcommand)]
    command: AnnouncementsSubcommand,
}

#[derive(Subcommand, Debug)]
enum AnnouncementsSubcommand {
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        kind: Option<String>,
    },
    Show {
        id: i64,
    },
    Create(DraftArgs),
    Update {
        id: i64,
        #[command(flatten)]
        draft: DraftArgs,
    },
    Publish {
        id: i64,
    },
    Archive {
        id: i64,
    },
    Delete {
        id: i64,
    },
}

#[derive(Args, Debug)]
struct DraftArgs {
    #[arg(long)]
    title: Option<String>,
    #[arg(long)]
    content: Option<String>,
    #[arg(long)]
    kind: Option<String>,
    #[arg(long)]
    priority: Option<i64>,
}

impl From<DraftArgs> for AnnouncementDraft {
    fn from(args: DraftArgs) -> Self {
        Self { title: args.title, content: args.content, kind: args.kind, priority: args.priority }
    }
}

/// Prints notices on stderr so stdout stays machine-readable.
struct StderrNotifier;

impl Notifier for StderrNotifier {
    fn notify(&self, notice: Notice) {
        eprintln!("[{}] {}", notice.level, notice.message);
        if notice.level == NoticeLevel::Error {
            tracing::debug!(message = %notice.message, "error notice shown");
        }
    }
}

fn main() -> Result<(), CliError> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("ignoring unreadable .env: {e}");
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    // Before the runtime starts: the local UTC offset is only readable while
    // the process has a single thread.
    let mut config = PortalConfig::from_env()?;
    if let Some(base_url) = &cli.base_url {
        config = config.with_base_url(base_url);
    }
    let session_file = match cli.session_file {
        Some(path) => path,
        None => default_session_file()?,
    };
    let storage = Arc::new(FileStorage::open(&session_file)?);
    tracing::debug!(path = %session_file.display(), profile = config.profile.name(), "session storage opened");

    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    runtime.block_on(async move {
        let portal = Portal::new(config, storage, Arc::new(StderrNotifier))?;
        run(&portal, cli.command).await
    })
}

fn default_session_file() -> Result<PathBuf, CliError> {
    let dir = dirs::config_dir().ok_or(CliError::NoConfigDir)?;
    Ok(dir.join("portal").join("session.json"))
}

async fn run(portal: &Portal, command: Command) -> Result<(), CliError> {
    let api = portal.api();
    match command {
        Command::Login { username, password } => {
            let envelope = portal.auth().login(&Credentials::new(&username, &password)).await?;
            eprintln!("signed in as {username} ({})", portal.auth().user_role());
            print_envelope(envelope)
        }
        Command::Logout => {
            portal.auth().logout().await;
            eprintln!("signed out");
            Ok(())
        }
        Command::Whoami => {
            if !portal.auth().check_auth().await {
                return Err(CliError::NotSignedIn);
            }
            print_json(&serde_json::to_value(portal.auth().user_info())?)
        }
        Command::Health => print_envelope(api.health().await?),
        Command::Patient { id } => print_envelope(api.patient(id.as_deref()).await?),
        Command::Upload { file } => {
            let bytes = std::fs::read(&file)?;
            let name = file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            print_envelope(api.upload_dicom(&name, bytes).await?)
        }
        Command::Template { output } => {
            let bytes = api.download_template().await?;
            std::fs::write(&output, &bytes)?;
            eprintln!("saved {} bytes to {}", bytes.len(), output.display());
            Ok(())
        }
        Command::Predict(args) => {
            let target = match (args.patient, args.image_url) {
                (Some(id), _) => PredictTarget::Patient { id },
                (None, Some(image_url)) => PredictTarget::Image { image_url, patient_id: args.patient_id },
                (None, None) => return Err(CliError::Usage("nothing to predict; pass --patient or --image-url".to_owned())),
            };
            print_envelope(api.predict(&target).await?)
        }
        Command::Analyze { payload } => print_envelope(api.analyze(serde_json::from_str(&payload)?).await?),
        Command::History { page, per_page, patient_id } => {
            let query = HistoryQuery { page, per_page, patient_id };
            print_envelope(api.diagnosis_history(&query).await?)
        }
        Command::Record(record) => match record.command {
            RecordSubcommand::Show { id } => print_envelope(api.diagnosis(id).await?),
            RecordSubcommand::Notes { id, diagnosis, suggestion, conclusion } => {
                let notes =
                    DoctorNotes { doctor_diagnosis: diagnosis, doctor_suggestion: suggestion, diagnosis_conclusion: conclusion };
                print_envelope(api.save_doctor_notes(id, &notes).await?)
            }
        },
        Command::Statistics => print_envelope(api.statistics().await?),
        Command::Settings(settings) => run_settings(portal, settings.command).await,
        Command::Models(models) => match models.command {
            ModelsSubcommand::List => print_envelope(api.models().await?),
            ModelsSubcommand::Current => print_envelope(api.current_model().await?),
            ModelsSubcommand::Switch { name } => print_envelope(api.switch_model(&name).await?),
            ModelsSubcommand::Delete { name } => print_envelope(api.delete_model(&name).await?),
        },
        Command::Announcements(announcements) => run_announcements(portal, announcements.command).await,
        Command::Route { path } => {
            let navigation = portal.router().push(&path)?;
            println!("{}", navigation.path());
            if let Some(title) = navigation.title {
                eprintln!("title: {title}");
            }
            Ok(())
        }
        Command::Watch { once } => run_watch(portal, once).await,
    }
}

async fn run_settings(portal: &Portal, command: SettingsSubcommand) -> Result<(), CliError> {
    let api = portal.api();
    match command {
        SettingsSubcommand::Show { key: Some(key) } => print_envelope(api.setting(&key).await?),
        SettingsSubcommand::Show { key: None } => print_envelope(api.settings().await?),
        SettingsSubcommand::Set { key, value, category } => {
            let parsed = serde_json::from_str(&value).unwrap_or(Value::String(value));
            let mut settings = Map::new();
            settings.insert(key, parsed);
            print_envelope(api.update_settings(settings, category.as_deref()).await?)
        }
        SettingsSubcommand::Reset { category } => print_envelope(api.reset_settings(category.as_deref()).await?),
    }
}

async fn run_announcements(portal: &Portal, command: AnnouncementsSubcommand) -> Result<(), CliError> {
    let api = portal.api();
    match command {
        AnnouncementsSubcommand::List { status, kind } => {
            print_envelope(api.announcements(&AnnouncementQuery { status, kind }).await?)
        }
        AnnouncementsSubcommand::Show { id } => print_envelope(api.announcement(id).await?),
        AnnouncementsSubcommand::Create(draft) => print_envelope(api.create_announcement(&draft.into()).await?),
        AnnouncementsSubcommand::Update { id, draft } => {
            print_envelope(api.update_announcement(id, &draft.into()).await?)
        }
        AnnouncementsSubcommand::Publish { id } => print_envelope(api.publish_announcement(id).await?),
        AnnouncementsSubcommand::Archive { id } => print_envelope(api.archive_announcement(id).await?),
        AnnouncementsSubcommand::Delete { id } => print_envelope(api.delete_announcement(id).await?),
    }
}

async fn run_watch(portal: &Portal, once: bool) -> Result<(), CliError> {
    let handle = portal.realtime();
    if !handle.is_active() {
        return Err(CliError::RealtimeDisabled);
    }
    let mut state = handle.subscribe();
    let mut last = state.borrow().clone();
    eprintln!("{}", last.status_message);

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    eprintln!("realtime channel closed");
                    break;
                }
                let current = state.borrow_and_update().clone();
                if current.status_message != last.status_message || (current.percentage - last.percentage).abs() > f64::EPSILON {
                    eprintln!("{:>5.1}%  {}", current.percentage, current.status_message);
                }
                let finished = current.result != last.result || (last.is_processing && !current.is_processing);
                if current.result != last.result {
                    print_json(&serde_json::json!({
                        "image_url": current.result.image_url,
                        "feature_list": current.result.feature_list,
                        "area": current.result.area,
                        "perimeter": current.result.perimeter,
                        "record_id": current.result.record_id,
                    }))?;
                }
                last = current;
                if once && finished {
                    break;
                }
            }
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::warn!(error = %e, "ctrl-c handler failed");
                }
                break;
            }
        }
    }

    handle.disconnect().await;
    Ok(())
}

/// Print `data` of a successful envelope; a rejection becomes an error.
fn print_envelope<T: Serialize>(envelope: Envelope<T>) -> Result<(), CliError> {
    let notice = if envelope.is_success() { envelope.message.clone() } else { None };
    let data = envelope.into_result("request failed").map_err(ApiError::from)?;
    if let Some(message) = notice {
        eprintln!("{message}");
    }
    match data {
        Some(data) => print_json(&serde_json::to_value(data)?),
        None => Ok(()),
    }
}

fn print_json(value: &Value) -> Result<(), CliError> {
    let rendered = serde_json::to_string_pretty(value)?;
    println!("{rendered}");
    Ok(())
}

#[cfg(test)]
#[path = "main_test.rs"]
mod tests;

//! muon CLI entry point

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use muon::auth::{now_epoch, Capability, OidcAuthenticator, OidcSettings, TokenStore};
use muon::config::Config;
use muon::error::{Error, UNKNOWN_OUTCOME_EXIT_CODE};
use muon::storage::{section_key, StorageCredentialBroker, StorageCredentialStore};
use muon::ui;
use muon::vm::{
    self, CloneRequest, PowerAction, Protocol, Provisioner, TaskOutcome, TaskTracker, VmApi, VmClient,
};

#[derive(Parser)]
#[command(name = "muon")]
#[command(about = "Command-line client for the VM and object-storage backend")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    login: LoginArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct LoginArgs {
    /// Never open a browser; log in with username and password
    #[arg(long, global = true)]
    headless: bool,

    /// Username for headless login
    #[arg(long, global = true)]
    username: Option<String>,

    /// Password for headless login (prompted when only a username is given)
    #[arg(long, global = true)]
    password: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or update ~/.muon/config.json
    Init,

    /// Log in and cache tokens for the configured clients
    Login,

    /// Show configuration and cached credential state
    Status,

    /// Manage virtual machines
    Vm {
        #[command(subcommand)]
        command: VmCommand,
    },

    /// Object storage credentials
    Storage {
        #[command(subcommand)]
        command: StorageCommand,
    },
}

#[derive(Args)]
struct VmTarget {
    /// VM id
    #[arg(long)]
    vm_id: u64,
}

#[derive(Subcommand)]
enum VmCommand {
    /// Clone a new VM from a template and provision it
    New {
        /// Name for the VM; keep it unique
        #[arg(long)]
        name: String,

        /// Template to clone from [default: from config]
        #[arg(long)]
        template: Option<String>,

        /// Backend block storage [default: from config]
        #[arg(long)]
        storage: Option<String>,

        /// Path to your public SSH key
        #[arg(long)]
        ssh_key: PathBuf,
    },

    /// Provision an existing VM with your user and SSH key
    Provision {
        #[arg(long)]
        vm_id: u64,

        /// Path to your public SSH key
        #[arg(long)]
        ssh_key: PathBuf,
    },

    /// List your VMs
    List {
        #[arg(long)]
        json: bool,
    },

    /// List templates that can be cloned
    Templates {
        #[arg(long)]
        json: bool,
    },

    /// Show the status of a VM
    Status {
        #[arg(long)]
        vm_id: u64,

        #[arg(long)]
        json: bool,
    },

    Start(VmTarget),
    Stop(VmTarget),
    Shutdown(VmTarget),
    Reboot(VmTarget),
    Reset(VmTarget),
    Suspend(VmTarget),
    Resume(VmTarget),

    /// Look up a VM id by name
    GetId {
        #[arg(long)]
        name: String,

        #[arg(long)]
        json: bool,
    },

    /// Open a console on a VM
    Connect {
        #[arg(long)]
        vm_id: u64,

        #[arg(long, value_enum, default_value_t = ProtocolArg::Spice)]
        protocol: ProtocolArg,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProtocolArg {
    Spice,
    Vnc,
    Ssh,
}

impl From<ProtocolArg> for Protocol {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Spice => Protocol::Spice,
            ProtocolArg::Vnc => Protocol::Vnc,
            ProtocolArg::Ssh => Protocol::Ssh,
        }
    }
}

#[derive(Subcommand)]
enum StorageCommand {
    /// Print temporary storage credentials (refreshing them if needed)
    Credentials {
        #[arg(long)]
        json: bool,
    },

    /// Print shell exports for S3 tooling
    Env,

    /// Open the storage web console
    Ui,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            ui::print_error(&e.to_string());
            let code = e.downcast_ref::<Error>().map(Error::exit_code).unwrap_or(1);
            std::process::exit(code);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Commands::Init => {
            ui::print_header("Setup");
            muon::config::init()?;
            ui::print_step("Next: run 'muon login'");
            Ok(0)
        }
        Commands::Login => run_login(&cli.login).await,
        Commands::Status => run_status(),
        Commands::Vm { command } => run_vm(command, &cli.login).await,
        Commands::Storage { command } => run_storage(command, &cli.login).await,
    }
}

fn has_display() -> bool {
    if cfg!(windows) || cfg!(target_os = "macos") {
        return true;
    }
    ["DISPLAY", "WAYLAND_DISPLAY"]
        .iter()
        .any(|var| std::env::var(var).map(|v| !v.is_empty()).unwrap_or(false))
}

fn capability(login: &LoginArgs, settings: &OidcSettings) -> Result<Capability> {
    if !login.headless && has_display() {
        return Ok(Capability::browser(settings));
    }

    let username = match (&login.username, &login.password) {
        (None, Some(_)) => Some(whoami::username()),
        (username, _) => username.clone(),
    };
    let password = match (&username, &login.password) {
        (Some(user), None) => Some(
            inquire::Password::new(&format!("Password for {}:", user))
                .without_confirmation()
                .prompt()?,
        ),
        (_, password) => password.clone(),
    };

    Ok(Capability::Headless { username, password })
}

fn authenticator(
    config: &Config,
    login: &LoginArgs,
    client_id: &str,
    client_secret: &str,
) -> Result<Arc<OidcAuthenticator>> {
    let settings = OidcSettings::from_config(&config.auth, client_id, client_secret);
    let capability = capability(login, &settings)?;
    let authenticator = OidcAuthenticator::over_http(settings, capability, TokenStore::default_location())?;
    Ok(Arc::new(authenticator))
}

async fn run_login(login: &LoginArgs) -> Result<i32> {
    let config = muon::config::load()?;

    let mut clients = vec![
        (config.vm.client_id.as_str(), config.vm.client_secret.as_str()),
        (config.storage.client_id.as_str(), config.storage.client_secret.as_str()),
    ];
    clients.dedup_by_key(|(id, _)| *id);

    for (client_id, client_secret) in clients {
        let auth = authenticator(&config, login, client_id, client_secret)?;
        let record = auth.get_valid_token().await?;
        ui::print_success(&format!(
            "Logged in as client {} (valid until {})",
            client_id,
            format_epoch(record.expires_in)
        ));
    }
    Ok(0)
}

fn run_status() -> Result<i32> {
    let config = muon::config::load()?;
    ui::print_header("Status");

    let now = now_epoch();
    let tokens = TokenStore::default_location();
    let mut rows = vec![("Config", format!("{:?}", muon::config::config_path()))];

    for client_id in [&config.vm.client_id, &config.storage.client_id] {
        let state = match tokens.load(client_id)? {
            Some(record) if !record.is_access_expired(now) => {
                format!("valid until {}", format_epoch(record.expires_in))
            }
            Some(record) if record.can_refresh(now, muon::auth::REFRESH_BUFFER_SECS) => {
                "expired (refreshable)".to_string()
            }
            Some(_) => "expired (run 'muon login')".to_string(),
            None => "not logged in".to_string(),
        };
        rows.push(("Token", format!("{}: {}", client_id, state)));
    }

    let section = section_key(&config.storage.url)?;
    let storage_state = match StorageCredentialStore::default_location().load(&section)? {
        Some(record) if !record.is_expired(now) => format!("valid until {}", format_epoch(record.expiry_epoch)),
        Some(_) => "expired".to_string(),
        None => "none".to_string(),
    };
    rows.push(("Storage", format!("[{}] {}", section, storage_state)));

    ui::print_fields(rows);
    Ok(0)
}

async fn run_vm(command: VmCommand, login: &LoginArgs) -> Result<i32> {
    let config = muon::config::load()?;
    let auth = authenticator(&config, login, &config.vm.client_id, &config.vm.client_secret)?;
    let client = VmClient::new(config.vm.url.clone(), auth);

    let progress = ui::TaskProgress::new();
    let provisioner = Provisioner::new(
        &client,
        TaskTracker::from_config(&config.tracker),
        &progress,
        &config.vm,
    );

    let outcome = match command {
        VmCommand::New { name, template, storage, ssh_key } => {
            let request = CloneRequest {
                name,
                template: template.unwrap_or_else(|| config.vm.default_template.clone()),
                storage: storage.unwrap_or_else(|| config.vm.default_storage.clone()),
            };
            provisioner.create(&request, &ssh_key).await?
        }
        VmCommand::Provision { vm_id, ssh_key } => provisioner.provision(vm_id, &ssh_key).await?,
        VmCommand::List { json } => {
            let pb = ui::spinner("Looking up all your VMs...");
            let vms = client.list().await;
            pb.finish_and_clear();
            let vms = vms?;
            if json {
                println!("{}", serde_json::to_string_pretty(&vms)?);
            } else {
                for vm in &vms {
                    let title = vm.get("vm_id").map(|id| format!("VM {}", plain(id)));
                    print_object(title.as_deref().unwrap_or("VM"), vm);
                }
            }
            return Ok(0);
        }
        VmCommand::Templates { json } => {
            let templates = client.templates().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "templates": templates }))?);
            } else {
                ui::print_header("VM Templates");
                for template in templates {
                    ui::print_step(&template);
                }
            }
            return Ok(0);
        }
        VmCommand::Status { vm_id, json } => {
            let pb = ui::spinner(&format!("Obtaining VM {}'s status...", vm_id));
            let status = client.status(vm_id).await;
            pb.finish_and_clear();
            let status = status?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_object("VM Status", &status);
            }
            return Ok(0);
        }
        VmCommand::Start(target) => provisioner.change_state(target.vm_id, PowerAction::Start).await?,
        VmCommand::Stop(target) => provisioner.change_state(target.vm_id, PowerAction::Stop).await?,
        VmCommand::Shutdown(target) => provisioner.change_state(target.vm_id, PowerAction::Shutdown).await?,
        VmCommand::Reboot(target) => provisioner.change_state(target.vm_id, PowerAction::Reboot).await?,
        VmCommand::Reset(target) => provisioner.change_state(target.vm_id, PowerAction::Reset).await?,
        VmCommand::Suspend(target) => provisioner.change_state(target.vm_id, PowerAction::Suspend).await?,
        VmCommand::Resume(target) => provisioner.change_state(target.vm_id, PowerAction::Resume).await?,
        VmCommand::GetId { name, json } => {
            let vm_id = client.vm_id(&name).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "vm_id": vm_id }))?);
            } else {
                ui::print_fields([("VM name", name), ("VM id", vm_id.to_string())]);
            }
            return Ok(0);
        }
        VmCommand::Connect { vm_id, protocol } => {
            vm::connect(&client, vm_id, protocol.into(), &config.vm.remote_viewer).await?;
            return Ok(0);
        }
    };

    report(outcome)
}

/// Map a task verdict to an exit code; failures become errors
fn report(outcome: TaskOutcome) -> Result<i32> {
    match outcome {
        TaskOutcome::Succeeded => Ok(0),
        TaskOutcome::Failed(detail) => Err(Error::TaskFailed(detail).into()),
        TaskOutcome::Unknown(reason) => {
            ui::print_warning(&format!(
                "Could not determine whether the task finished ({}). Check 'muon vm status'",
                reason
            ));
            Ok(UNKNOWN_OUTCOME_EXIT_CODE)
        }
    }
}

async fn run_storage(command: StorageCommand, login: &LoginArgs) -> Result<i32> {
    let config = muon::config::load()?;

    if let StorageCommand::Ui = command {
        ui::print_step(&format!("Opening {}", config.storage.ui_url));
        open::that(&config.storage.ui_url)?;
        return Ok(0);
    }

    let auth = authenticator(&config, login, &config.storage.client_id, &config.storage.client_secret)?;
    let broker = StorageCredentialBroker::over_http(
        &config.storage.url,
        config.storage.duration_secs,
        StorageCredentialStore::default_location(),
        auth,
    )?;
    let creds = broker.get_valid_credentials().await?;

    match command {
        StorageCommand::Credentials { json: true } => {
            let value = serde_json::json!({
                "section": creds.section,
                "aws_access_key_id": creds.access_key_id,
                "aws_secret_access_key": creds.secret_access_key,
                "aws_session_token": creds.session_token,
                "expiry": creds.expiry_epoch,
            });
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        StorageCommand::Credentials { json: false } => {
            ui::print_fields([
                ("Section", creds.section.clone()),
                ("Access key id", creds.access_key_id.clone()),
                ("Secret access key", creds.secret_access_key.clone()),
                ("Session token", creds.session_token.clone()),
                ("Expires", format_epoch(creds.expiry_epoch)),
            ]);
            ui::print_success(&format!(
                "Saved to {:?} under [{}]",
                StorageCredentialStore::default_location().path(),
                broker.section()
            ));
        }
        StorageCommand::Env => {
            println!("export AWS_ACCESS_KEY_ID={}", creds.access_key_id);
            println!("export AWS_SECRET_ACCESS_KEY={}", creds.secret_access_key);
            println!("export AWS_SESSION_TOKEN={}", creds.session_token);
            println!("export AWS_ENDPOINT_URL={}", config.storage.url);
        }
        StorageCommand::Ui => {}
    }
    Ok(0)
}

fn format_epoch(epoch: i64) -> String {
    chrono::DateTime::from_timestamp(epoch, 0)
        .map(|dt| dt.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| epoch.to_string())
}

fn plain(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn print_object(title: &str, value: &Value) {
    ui::print_header(title);
    match value.as_object() {
        Some(map) => ui::print_fields(map.iter().map(|(k, v)| (k.as_str(), plain(v)))),
        None => println!("  {}", plain(value)),
    }
}

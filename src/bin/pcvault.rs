use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use miette::IntoDiagnostic;
use tracing_subscriber::EnvFilter;

use pointcloud_vault::accounting::FileAccountStore;
use pointcloud_vault::app::Vault;
use pointcloud_vault::config::{ConfigLoader, ResolvedConfig};
use pointcloud_vault::convert::{Converter, ProcessConverter};
use pointcloud_vault::domain::{OwnerId, ProjectId};
use pointcloud_vault::error::{ErrorKind, VaultError};
use pointcloud_vault::output::JsonOutput;

#[derive(Parser)]
#[command(name = "pcvault")]
#[command(about = "Point-cloud ingestion, conversion, and storage accounting")]
#[command(version, author)]
struct Cli {
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Upload and convert a .las/.laz file")]
    Upload(UploadArgs),
    #[command(about = "List converted projects")]
    List(ListArgs),
    #[command(about = "Show one project descriptor")]
    Show { project_id: String },
    #[command(about = "Delete a project and release its storage")]
    Delete { project_id: String },
    #[command(about = "Read or publish the demo project")]
    Demo(DemoArgs),
    #[command(about = "Recompute every user's counters from the store")]
    Resync,
    #[command(about = "Project count and bytes for an owner, computed from the store")]
    Totals(OwnerArgs),
    #[command(about = "Storage used against the configured limit")]
    Usage(OwnerArgs),
    #[command(about = "Store-wide statistics")]
    Stats,
    #[command(about = "Remove project directories left behind by interrupted conversions")]
    Sweep(SweepArgs),
}

#[derive(Args)]
struct UploadArgs {
    file: PathBuf,

    #[arg(long)]
    owner: String,

    #[arg(
        long,
        help = "Original file name recorded on the project; must end in .las or .laz (defaults to the file name)"
    )]
    name: Option<String>,
}

#[derive(Args)]
struct ListArgs {
    #[arg(long, conflicts_with = "all", required_unless_present = "all")]
    owner: Option<String>,

    #[arg(long)]
    all: bool,
}

#[derive(Args)]
struct OwnerArgs {
    #[arg(long)]
    owner: String,
}

#[derive(Args)]
struct DemoArgs {
    #[command(subcommand)]
    command: DemoCommand,
}

#[derive(Subcommand)]
enum DemoCommand {
    #[command(about = "Print the current demo pointer")]
    Get,
    #[command(about = "Point the demo at an existing project")]
    Set {
        project_id: String,
        display_name: String,
    },
}

#[derive(Args)]
struct SweepArgs {
    #[arg(long)]
    grace_secs: Option<u64>,
}

/// Converter used by the CLI; absent when no converter is configured.
enum CliConverter {
    Process(ProcessConverter),
    Unconfigured,
}

#[async_trait]
impl Converter for CliConverter {
    async fn convert(&self, input: &Path, output_dir: &Path) -> Result<(), VaultError> {
        match self {
            CliConverter::Process(converter) => converter.convert(input, output_dir).await,
            CliConverter::Unconfigured => Err(VaultError::MissingConverter),
        }
    }
}

type CliVault = Vault<CliConverter, FileAccountStore>;

fn main() -> ExitCode {
    if let Err(report) = run() {
        eprintln!("{report:?}");
        if let Some(err) = report.downcast_ref::<VaultError>() {
            return ExitCode::from(map_exit_code(err));
        }
        return ExitCode::from(1);
    }
    ExitCode::SUCCESS
}

fn map_exit_code(error: &VaultError) -> u8 {
    match error.kind() {
        ErrorKind::Validation => 2,
        ErrorKind::Conversion => 3,
        ErrorKind::NotFound => 4,
        ErrorKind::Accounting | ErrorKind::Internal => 1,
    }
}

fn run() -> miette::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ConfigLoader::resolve(cli.config.as_deref())?;

    let runtime = tokio::runtime::Runtime::new().into_diagnostic()?;
    runtime.block_on(dispatch(cli.command, config))
}

async fn dispatch(command: Commands, config: ResolvedConfig) -> miette::Result<()> {
    let converter = match &config.converter {
        Some(converter_command) => {
            CliConverter::Process(ProcessConverter::new(converter_command.clone()))
        }
        None => CliConverter::Unconfigured,
    };
    let accounts = FileAccountStore::new(config.data_root.join("accounts.json"));
    let vault: CliVault = Vault::new(&config, Arc::new(converter), Arc::new(accounts));

    match command {
        Commands::Upload(args) => run_upload(&vault, &config, args).await,
        Commands::List(args) => {
            let projects = match args.owner {
                Some(owner) => vault.list_projects(&owner.parse::<OwnerId>()?).await?,
                None => vault.all_projects().await?,
            };
            JsonOutput::print_projects(&projects).into_diagnostic()
        }
        Commands::Show { project_id } => {
            let project = vault.project(&project_id.parse::<ProjectId>()?).await?;
            JsonOutput::print_project(&project).into_diagnostic()
        }
        Commands::Delete { project_id } => {
            let result = vault
                .delete_project(&project_id.parse::<ProjectId>()?)
                .await?;
            JsonOutput::print_delete(&result).into_diagnostic()
        }
        Commands::Demo(args) => match args.command {
            DemoCommand::Get => {
                let pointer = vault.require_demo().await?;
                JsonOutput::print_demo(&pointer).into_diagnostic()
            }
            DemoCommand::Set {
                project_id,
                display_name,
            } => {
                let pointer = vault
                    .set_demo(&project_id.parse::<ProjectId>()?, &display_name)
                    .await?;
                JsonOutput::print_demo(&pointer).into_diagnostic()
            }
        },
        Commands::Resync => {
            let report = vault.resync().await?;
            JsonOutput::print_resync(&report).into_diagnostic()
        }
        Commands::Totals(args) => {
            let totals = vault.live_totals(&args.owner.parse::<OwnerId>()?).await?;
            JsonOutput::print_totals(&totals).into_diagnostic()
        }
        Commands::Usage(args) => {
            let usage = vault.storage_usage(&args.owner.parse::<OwnerId>()?).await?;
            JsonOutput::print_usage(&usage).into_diagnostic()
        }
        Commands::Stats => {
            let stats = vault.stats().await?;
            JsonOutput::print_stats(&stats).into_diagnostic()
        }
        Commands::Sweep(args) => {
            let grace = Duration::from_secs(args.grace_secs.unwrap_or(config.orphan_grace_secs));
            let result = vault.sweep_orphans(grace).await?;
            JsonOutput::print_sweep(&result).into_diagnostic()
        }
    }
}

async fn run_upload(
    vault: &CliVault,
    config: &ResolvedConfig,
    args: UploadArgs,
) -> miette::Result<()> {
    if config.converter.is_none() {
        return Err(VaultError::MissingConverter.into());
    }
    let owner: OwnerId = args.owner.parse()?;
    let name = match args.name {
        Some(name) => name,
        None => args
            .file
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or(VaultError::MissingField("original_name"))?,
    };
    let file = tokio::fs::File::open(&args.file)
        .await
        .map_err(|err| VaultError::Filesystem(format!("open {}: {err}", args.file.display())))?;

    let pending = vault.upload(owner, &name, file).await?;
    tracing::info!(project_id = %pending.project_id(), "waiting for conversion");
    let project = pending.wait().await?;
    JsonOutput::print_project(&project).into_diagnostic()
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn upload_name_help_states_extension_rule() {
        let command = Cli::command();
        let upload = command.find_subcommand("upload").unwrap();
        let name = upload
            .get_arguments()
            .find(|arg| arg.get_id() == "name")
            .unwrap();
        let help = name.get_help().unwrap().to_string();
        assert!(help.contains(".las or .laz"));
    }

    #[test]
    fn exit_codes_follow_error_kind() {
        assert_eq!(map_exit_code(&VaultError::EmptyUpload), 2);
        assert_eq!(map_exit_code(&VaultError::Conversion("bad".to_string())), 3);
        assert_eq!(map_exit_code(&VaultError::DemoNotSet), 4);
        assert_eq!(map_exit_code(&VaultError::MissingConverter), 1);
    }
}

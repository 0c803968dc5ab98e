//! Integration Role Agent - Standalone Binary
//!
//! Converges, replaces, removes and inspects the cross-account IAM
//! integration role in a customer AWS account.
//!
//! ## Usage
//!
//! ```bash
//! # Create or converge the role
//! integration-role-agent converge --integration-name uptcloud --account-id 123456789012 \
//!     --upt-account-id 012345678912 --external-id 6a9375c1-47c0-470c-9217-d2f9d2d185f1
//!
//! # Also grant read access to an audit-log bucket
//! integration-role-agent converge ... --bucket-name audit-logs --bucket-region us-west-2
//!
//! # Recreate the role (e.g. to rotate the external ID)
//! integration-role-agent replace ... --external-id <new-id>
//!
//! # Remove the role and its policies
//! integration-role-agent teardown --integration-name uptcloud --account-id 123456789012
//!
//! # Print the role ARN as JSON
//! integration-role-agent --output json show --integration-name uptcloud --account-id 123456789012
//! ```

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use cspm_engine::agents::integration_role::{
    AccountTarget, AwsSessionProvider, IntegrationConfig, Reconciler, SessionConfig,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Integration Role Agent - Provision the CSPM cross-account IAM role
#[derive(Parser, Debug)]
#[command(name = "integration-role-agent", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Shared-config profile for the source credentials
    #[arg(long, global = true, env = "AWS_PROFILE")]
    profile: Option<String>,

    /// Output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    output: OutputFormat,

    /// Log format
    #[arg(long, global = true, value_enum, default_value = "text", env = "CSPM_LOG_FORMAT")]
    log_format: LogFormat,

    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the role or bring it up to date
    Converge {
        #[command(flatten)]
        desired: DesiredArgs,

        /// Stale state was removed by the caller; do not roll back on failure
        #[arg(long, env = "CSPM_IS_UPDATE")]
        update: bool,
    },
    /// Tear down, then converge as an update
    Replace {
        #[command(flatten)]
        desired: DesiredArgs,
    },
    /// Remove the role and everything attached to it
    Teardown {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Print the role ARN if the role exists
    Show {
        #[command(flatten)]
        target: TargetArgs,
    },
}

#[derive(Args, Debug)]
struct TargetArgs {
    /// Integration name, used as the role name
    #[arg(long, env = "CSPM_INTEGRATION_NAME")]
    integration_name: String,

    /// Target AWS account ID
    #[arg(long, env = "CSPM_ACCOUNT_ID")]
    account_id: String,

    /// Role assumed in the target account (default: OrganizationAccountAccessRole)
    #[arg(long, env = "CSPM_ORG_ACCESS_ROLE_NAME")]
    org_access_role_name: Option<String>,
}

#[derive(Args, Debug)]
struct DesiredArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Platform account allowed to assume the role
    #[arg(long, env = "CSPM_UPT_ACCOUNT_ID")]
    upt_account_id: String,

    /// External ID required by the trust policy
    #[arg(long, env = "CSPM_EXTERNAL_ID")]
    external_id: String,

    /// File holding an inline policy document to use instead of the default
    #[arg(long, env = "CSPM_POLICY_DOCUMENT_FILE")]
    policy_document_file: Option<PathBuf>,

    /// Audit-log bucket the role may read from
    #[arg(long, env = "CSPM_BUCKET_NAME", requires = "bucket_region")]
    bucket_name: Option<String>,

    /// Region of the audit-log bucket
    #[arg(long, env = "CSPM_BUCKET_REGION", requires = "bucket_name")]
    bucket_region: Option<String>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output
    Json,
}

#[derive(Debug, Clone, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn init_logging(format: &LogFormat, verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn account_target(args: &TargetArgs, session: &SessionConfig) -> AccountTarget {
    AccountTarget::new(&args.account_id)
        .with_role_name(args.org_access_role_name.clone())
        .with_partition(&session.partition)
}

/// Read an inline policy override from disk
fn load_policy_document(path: &Path) -> Result<String> {
    let document = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read policy document {}", path.display()))?;
    serde_json::from_str::<serde_json::Value>(&document)
        .with_context(|| format!("Policy document {} is not valid JSON", path.display()))?;
    Ok(document)
}

fn integration_config(args: &DesiredArgs, session: &SessionConfig) -> Result<IntegrationConfig> {
    let mut config = IntegrationConfig::new(
        &args.target.integration_name,
        account_target(&args.target, session),
        &args.upt_account_id,
        &args.external_id,
    );

    if let Some(path) = &args.policy_document_file {
        config = config.with_policy_document(load_policy_document(path)?);
    }

    if let (Some(name), Some(region)) = (&args.bucket_name, &args.bucket_region) {
        config = config.with_bucket(name, region);
    }

    Ok(config)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialize result")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_format, cli.verbose);

    let session = SessionConfig::from_env().with_profile(cli.profile.clone());

    info!(
        iam_region = %session.iam_region,
        partition = %session.partition,
        "Starting Integration Role Agent"
    );

    let reconciler = Reconciler::new(Arc::new(AwsSessionProvider::new(session.clone())))
        .with_iam_region(&session.iam_region);

    match &cli.command {
        Command::Converge { desired, update } => {
            let mut config = integration_config(desired, &session)?;
            if *update {
                config = config.for_update();
            }
            let outcome = reconciler
                .converge(&config)
                .await
                .context("Failed to converge integration role")?;
            match cli.output {
                OutputFormat::Text => println!("{}", outcome.display()),
                OutputFormat::Json => print_json(&outcome)?,
            }
        }
        Command::Replace { desired } => {
            let config = integration_config(desired, &session)?;
            let outcome = reconciler
                .replace(&config)
                .await
                .context("Failed to replace integration role")?;
            match cli.output {
                OutputFormat::Text => println!("{}", outcome.display()),
                OutputFormat::Json => print_json(&outcome)?,
            }
        }
        Command::Teardown { target } => {
            let outcome = reconciler
                .teardown(&account_target(target, &session), &target.integration_name)
                .await
                .context("Failed to tear down integration role")?;
            match cli.output {
                OutputFormat::Text => println!("{}", outcome.display()),
                OutputFormat::Json => print_json(&outcome)?,
            }
        }
        Command::Show { target } => {
            let role_arn = reconciler
                .read_role_arn(&account_target(target, &session), &target.integration_name)
                .await
                .context("Failed to read integration role")?;
            match cli.output {
                OutputFormat::Text => match &role_arn {
                    Some(arn) => println!("Integration Role:\n  Name: {}\n  ARN: {}", target.integration_name, arn),
                    None => println!("Integration role {} not found", target.integration_name),
                },
                OutputFormat::Json => print_json(&serde_json::json!({
                    "integration_name": target.integration_name,
                    "role_arn": role_arn,
                }))?,
            }
        }
    }

    Ok(())
}

use anyhow::Context;
use clap::{Parser, Subcommand};
use fhir::{Parameter, Parameters, StartJobsRequest};
use rcapi_core::{core_config_from_lookup, tuple, Backends, FileJobStore, Orchestrator};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "rcapi")]
#[command(about = "Results combining orchestrator CLI")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a job package for one patient and print the evidence bundle
    Run {
        /// Job package (Questionnaire) name
        job_package: String,
        /// Patient server id
        #[arg(long, conflicts_with = "patient_identifier", required_unless_present = "patient_identifier")]
        patient_id: Option<String>,
        /// Patient identifier (`system|value`), resolved through the patient directory
        #[arg(long)]
        patient_identifier: Option<String>,
        /// Run only this library (`Name.cql` / `Name.nlpql`)
        #[arg(long)]
        job: Option<String>,
        /// Job package version
        #[arg(long)]
        version: Option<String>,
    },
    /// Decode a tuple string and print its records as JSON
    DecodeTuple {
        /// Encoded tuple list, e.g. `[Tuple {"answerValue": "x"}]`
        input: String,
    },
    /// Print a stored job's status document
    Status {
        /// Job id
        job_id: String,
    },
    /// Probe the configured backends
    Health,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "warn".into());
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("rcapi_core={log_level}").parse()?),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run {
            job_package,
            patient_id,
            patient_identifier,
            job,
            version,
        }) => {
            let mut parameter = vec![Parameter::string("jobPackage", job_package)];
            if let Some(id) = patient_id {
                parameter.push(Parameter::string("patientId", id));
            }
            if let Some(identifier) = patient_identifier {
                parameter.push(Parameter::string("patientIdentifier", identifier));
            }
            if let Some(job) = job {
                parameter.push(Parameter::string("job", job));
            }
            if let Some(version) = version {
                parameter.push(Parameter::string("jobPackageVersion", version));
            }
            let request = StartJobsRequest::from_parameters(&Parameters::new(parameter))?;

            let orchestrator = orchestrator()?;
            match orchestrator.run_sync(&request).await {
                Ok(bundle) => println!("{}", serde_json::to_string_pretty(&bundle)?),
                Err(e) => {
                    println!("{}", serde_json::to_string_pretty(&e.to_outcome())?);
                    anyhow::bail!("run failed: {e}");
                }
            }
        }
        Some(Commands::DecodeTuple { input }) => {
            let records = tuple::decode(&input).context("could not decode tuple string")?;
            let fields: Vec<_> = records.iter().map(|record| record.fields()).collect();
            println!("{}", serde_json::to_string_pretty(&fields)?);
        }
        Some(Commands::Status { job_id }) => {
            let orchestrator = orchestrator()?;
            let job = orchestrator.status(&job_id).await?;
            println!("{}", serde_json::to_string_pretty(&job.to_parameters())?);
        }
        Some(Commands::Health) => {
            let orchestrator = orchestrator()?;
            let outcome = orchestrator.health().await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        None => {
            println!("Use 'rcapi --help' for commands");
        }
    }

    Ok(())
}

/// An orchestrator over the configured backends and the on-disk job store.
fn orchestrator() -> anyhow::Result<Arc<Orchestrator>> {
    let config = core_config_from_lookup(|key| std::env::var(key).ok())?;
    let store = FileJobStore::open(config.job_data_dir()).with_context(|| {
        format!(
            "could not open job store at {}",
            config.job_data_dir().display()
        )
    })?;
    let backends = Backends::from_config(&config);
    Ok(Arc::new(Orchestrator::new(&config, backends, Arc::new(store))))
}

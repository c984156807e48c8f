use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use dotenv::dotenv;
use jwxt_scraper::{
    AchievementScraper, CredentialSource, CurriculumScraper, GradeQuery, LoadFromEnv,
    PortalConfig, RecordStore, ScheduleQuery, SessionManager, StoreConfig,
    captcha::solver_from_config,
    credentials,
    export::{Format, render},
    semester_scraper::scrape_semesters,
    student_info_scraper::{format_student_info, scrape_student_info},
    sync::sync,
    table_scraper::{Listing, format_records, scrape_listing},
};
use log::{LevelFilter, error, info};

#[derive(Debug, Parser)]
#[command(name = "jwxt", version, about = "Command line client for the jsxsd academic portal")]
struct Cli {
    /// Always prompt for credentials instead of reading env vars or the config file.
    #[arg(short, long, global = true)]
    interactive: bool,

    /// JSON file with an `educational_system` credentials section.
    #[arg(long, global = true, default_value = "config/config.json")]
    config: PathBuf,

    /// More logging (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Json,
    Csv,
}

impl From<OutputFormat> for Format {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Json => Format::Json,
            OutputFormat::Csv => Format::Csv,
        }
    }
}

#[derive(Debug, Args)]
struct OutputArgs {
    #[arg(long, value_enum, default_value = "json")]
    format: OutputFormat,
    /// Write to this file instead of stdout.
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Log in (reusing saved cookies when they are still valid).
    Login,
    /// Forget the saved session.
    Logout,
    /// Print the logged in student's name.
    Whoami,
    Grades {
        /// Term such as 2024-2025-1; empty for all terms.
        #[arg(long, default_value = "")]
        term: String,
        #[arg(long, default_value = "")]
        nature: String,
        #[arg(long, default_value = "")]
        name: String,
        #[command(flatten)]
        output: OutputArgs,
    },
    Schedule {
        /// Teaching week; empty for every week.
        #[arg(long, default_value = "")]
        week: String,
        /// Term such as 2024-2025-1; empty for the current term.
        #[arg(long, default_value = "")]
        term: String,
        #[command(flatten)]
        output: OutputArgs,
    },
    /// List the terms the portal knows about.
    Terms,
    Exams,
    Evaluations,
    StudentInfo,
    /// Scrape grades and schedule and store them in MySQL/Redis.
    Sync,
}

fn emit(text: &str, output: Option<&PathBuf>) -> anyhow::Result<()> {
    match output {
        Some(path) => {
            std::fs::write(path, text)?;
            info!("Wrote {}", path.display());
        }
        None => println!("{text}"),
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = PortalConfig::load_from_env()?;
    let solver = solver_from_config(config.edu_captcha_command.as_deref());

    // Sync needs the credentials themselves for the record keys, so resolve
    // them up front instead of lazily at login time.
    let fixed = match cli.command {
        Command::Sync => Some(credentials::resolve(&cli.config, cli.interactive)?),
        _ => None,
    };
    let source = match &fixed {
        Some(creds) => CredentialSource::Fixed(creds.clone()),
        None => CredentialSource::Resolve {
            config_file: cli.config.clone(),
            force_input: cli.interactive,
        },
    };
    let mut session = SessionManager::new(config, solver, source)?;

    match cli.command {
        Command::Login => {
            session.ensure_logged_in().await?;
            println!("Logged in as {}", session.user_name().await?);
        }
        Command::Logout => {
            session.logout()?;
            println!("Logged out");
        }
        Command::Whoami => println!("{}", session.user_name().await?),
        Command::Grades {
            term,
            nature,
            name,
            output,
        } => {
            let query = GradeQuery {
                term,
                course_nature: nature,
                course_name: name,
                ..GradeQuery::default()
            };
            let cache = session.config().achievement_cache();
            let grades = AchievementScraper::new(query, cache)
                .scrape(&mut session)
                .await?;
            emit(&render(&grades, output.format.into())?, output.output.as_ref())?;
        }
        Command::Schedule { week, term, output } => {
            let cache = session.config().curriculum_cache();
            let entries = CurriculumScraper::new(ScheduleQuery { week, term }, cache)
                .scrape(&mut session)
                .await?;
            emit(&render(&entries, output.format.into())?, output.output.as_ref())?;
        }
        Command::Terms => {
            let semesters = scrape_semesters(&mut session).await?;
            for term in &semesters.terms {
                let marker = if *term == semesters.current { " *" } else { "" };
                println!("{term}{marker}");
            }
        }
        Command::Exams => {
            let records = scrape_listing(&mut session, Listing::Exams).await?;
            println!("{}", format_records(Listing::Exams.title(), &records));
        }
        Command::Evaluations => {
            let records = scrape_listing(&mut session, Listing::Evaluations).await?;
            println!("{}", format_records(Listing::Evaluations.title(), &records));
        }
        Command::StudentInfo => {
            let info = scrape_student_info(&mut session).await?;
            println!("{}", format_student_info(&info));
        }
        Command::Sync => {
            let store_config = StoreConfig::load_from_env()?;
            let store = RecordStore::connect(&store_config).await?;
            if let Some(creds) = &fixed {
                let report = sync(&mut session, &store, creds).await?;
                println!(
                    "{}: {} grades, {} schedule entries ({:?})",
                    report.name, report.grades, report.schedule_entries, report.outcome
                );
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenv().ok();
    let cli = Cli::parse();
    let level = match cli.verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();

    if let Err(e) = run(cli).await {
        error!("{e:#}");
        std::process::exit(1);
    }
}

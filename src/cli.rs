use crate::app::{self, EventFields, Overrides, Turnstile};
use crate::model::{EventStatus, NewParticipant, RegistrationStatus, Role};
use anyhow::Result;
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "turnstile", version)]
#[command(
    about = "Capacity-safe event registration",
    long_about = "turnstile manages events, participants, and registrations in a local SQLite database. Admissions never exceed an event's capacity, even under concurrent and batched registration."
)]
#[command(arg_required_else_help = true)]
#[command(after_long_help = "Examples:
  turnstile event create --title \"Rust meetup\" --capacity 40
  turnstile participant add --first-name Ada --last-name Lovelace --email ada@example.com
  turnstile register --event 1 --participant 1
  turnstile batch-register --event 1 --participant 2 --participant 3
  turnstile event update 1 --role admin --capacity 50 --expect-version 0
  turnstile completion zsh > ~/.zsh/completions/_turnstile")]
struct Cli {
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Config file (default: $XDG_CONFIG_HOME/turnstile/config.toml when present)"
    )]
    config: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Path to database (default: $XDG_STATE_HOME/turnstile/turnstile.db)"
    )]
    db: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        value_name = "PATH",
        help = "Append every notification to this file as NDJSON"
    )]
    log: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    #[command(about = "Create, inspect, edit, and delete events")]
    #[command(arg_required_else_help = true)]
    Event {
        #[command(subcommand)]
        command: EventCommands,
    },
    #[command(about = "Manage participants")]
    #[command(arg_required_else_help = true)]
    Participant {
        #[command(subcommand)]
        command: ParticipantCommands,
    },
    #[command(
        about = "Register a participant for an event",
        long_about = "Register a participant for an event. Fails when the event is full or the participant is already registered."
    )]
    #[command(arg_required_else_help = true)]
    #[command(after_long_help = "Example:
  turnstile register --event 1 --participant 7")]
    Register {
        #[arg(long, value_name = "EVENT_ID", help = "Event to register for")]
        event: i64,
        #[arg(long, value_name = "PARTICIPANT_ID", help = "Participant to register")]
        participant: i64,
        #[arg(
            long,
            default_value = "confirmed",
            value_name = "STATUS",
            value_parser = ["confirmed", "pending", "cancelled"],
            help = "Registration status; only confirmed registrations take a seat"
        )]
        status: String,
    },
    #[command(about = "Remove a participant's registration")]
    #[command(arg_required_else_help = true)]
    Unregister {
        #[arg(long, value_name = "EVENT_ID", help = "Event to leave")]
        event: i64,
        #[arg(long, value_name = "PARTICIPANT_ID", help = "Participant to remove")]
        participant: i64,
    },
    #[command(
        about = "Register many participants through the worker pool",
        long_about = "Register many participants for one event through the bounded worker pool. Requests that do not fit in the queue are reported as rejected."
    )]
    #[command(arg_required_else_help = true)]
    #[command(after_long_help = "Example:
  turnstile batch-register --event 1 --participant 2 --participant 3 --participant 4")]
    BatchRegister {
        #[arg(long, value_name = "EVENT_ID", help = "Event to register for")]
        event: i64,
        #[arg(
            long = "participant",
            value_name = "PARTICIPANT_ID",
            required = true,
            help = "Participant to register (repeatable)"
        )]
        participants: Vec<i64>,
        #[arg(
            long,
            default_value_t = 60,
            value_name = "SECS",
            help = "How long to wait for results"
        )]
        timeout_secs: u64,
    },
    #[command(about = "List an event's registrations, newest first")]
    #[command(arg_required_else_help = true)]
    Roster {
        #[arg(value_name = "EVENT_ID", help = "Event to inspect")]
        event: i64,
    },
    #[command(
        about = "Generate shell completion script",
        long_about = "Generate shell completion script for your shell. Redirect output to your shell completion directory."
    )]
    #[command(arg_required_else_help = true)]
    #[command(after_long_help = "Examples:
  turnstile completion bash > ~/.local/share/bash-completion/completions/turnstile
  turnstile completion zsh > ~/.zsh/completions/_turnstile
  turnstile completion fish > ~/.config/fish/completions/turnstile.fish")]
    Completion {
        #[arg(value_enum, value_name = "SHELL", help = "Target shell")]
        shell: Shell,
    },
    #[command(
        about = "Generate a man page",
        long_about = "Generate a roff man page for turnstile."
    )]
    #[command(after_long_help = "Examples:
  turnstile man > turnstile.1
  turnstile man --output docs/turnstile.1")]
    Man {
        #[arg(
            long,
            value_name = "PATH",
            help = "Write man page to file (stdout when omitted)"
        )]
        output: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum EventCommands {
    #[command(about = "Create an event")]
    #[command(arg_required_else_help = true)]
    Create {
        #[command(flatten)]
        fields: EventArgs,
    },
    #[command(about = "Show one event and its seat usage")]
    #[command(arg_required_else_help = true)]
    Show {
        #[arg(value_name = "EVENT_ID")]
        event: i64,
    },
    #[command(about = "List events, latest start first")]
    List {
        #[arg(
            long,
            value_name = "TERM",
            help = "Only events whose title, description, or location contain TERM"
        )]
        search: Option<String>,
    },
    #[command(
        about = "Edit an event (admin only)",
        long_about = "Edit an event. The write is rejected if someone else changed the event since --expect-version was read."
    )]
    #[command(arg_required_else_help = true)]
    #[command(after_long_help = "Example:
  turnstile event update 3 --role admin --capacity 80 --expect-version 2")]
    Update {
        #[arg(value_name = "EVENT_ID")]
        event: i64,
        #[arg(
            long,
            default_value = "user",
            value_name = "ROLE",
            value_parser = ["admin", "user"],
            help = "Role of the caller"
        )]
        role: String,
        #[arg(
            long,
            value_name = "VERSION",
            help = "Version the edit is based on (default: current)"
        )]
        expect_version: Option<i64>,
        #[command(flatten)]
        fields: EventArgs,
    },
    #[command(about = "Delete an event and its registrations (admin only)")]
    #[command(arg_required_else_help = true)]
    Delete {
        #[arg(value_name = "EVENT_ID")]
        event: i64,
        #[arg(
            long,
            default_value = "user",
            value_name = "ROLE",
            value_parser = ["admin", "user"],
            help = "Role of the caller"
        )]
        role: String,
    },
}

#[derive(Subcommand, Debug)]
enum ParticipantCommands {
    #[command(about = "Add a participant")]
    #[command(arg_required_else_help = true)]
    Add {
        #[arg(long, value_name = "NAME")]
        first_name: String,
        #[arg(long, value_name = "NAME")]
        last_name: String,
        #[arg(long, value_name = "EMAIL")]
        email: String,
        #[arg(long, value_name = "PHONE")]
        phone: Option<String>,
        #[arg(long, value_name = "ID", help = "External identifier, e.g. a badge number")]
        identifier: Option<String>,
    },
    #[command(about = "List participants")]
    List,
}

#[derive(Args, Debug)]
struct EventArgs {
    #[arg(long, value_name = "TITLE")]
    title: Option<String>,
    #[arg(long, value_name = "TEXT")]
    description: Option<String>,
    #[arg(long, value_name = "PLACE")]
    location: Option<String>,
    #[arg(long, value_name = "RFC3339", help = "Start time, e.g. 2026-05-01T18:00:00Z")]
    start: Option<String>,
    #[arg(long, value_name = "RFC3339", help = "End time")]
    end: Option<String>,
    #[arg(long, value_name = "N", help = "Maximum confirmed registrations")]
    capacity: Option<i64>,
    #[arg(
        long,
        value_name = "STATUS",
        value_parser = ["active", "planned", "finished", "cancelled"]
    )]
    status: Option<String>,
}

impl EventArgs {
    fn into_fields(self) -> Result<EventFields> {
        Ok(EventFields {
            title: self.title,
            description: self.description,
            location: self.location,
            start_at: self.start,
            end_at: self.end,
            capacity: self.capacity,
            status: self
                .status
                .as_deref()
                .map(str::parse::<EventStatus>)
                .transpose()?,
        })
    }
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    let overrides = Overrides {
        config: cli.config,
        db: cli.db,
        log: cli.log,
    };
    match cli.command {
        Commands::Completion { shell } => {
            let mut cmd = Cli::command();
            let name = cmd.get_name().to_string();
            clap_complete::generate(shell, &mut cmd, name, &mut io::stdout());
            Ok(())
        }
        Commands::Man { output } => {
            let man = clap_mangen::Man::new(Cli::command());
            match output {
                Some(path) => {
                    let mut bytes = Vec::new();
                    man.render(&mut bytes)?;
                    fs::write(path, bytes)?;
                }
                None => {
                    man.render(&mut io::stdout())?;
                }
            }
            Ok(())
        }
        command => {
            let app = app::open(&overrides)?;
            let result = dispatch(&app, command);
            app.close();
            result
        }
    }
}

fn dispatch(app: &Turnstile, command: Commands) -> Result<()> {
    match command {
        Commands::Event { command } => match command {
            EventCommands::Create { fields } => app::create_event(app, fields.into_fields()?),
            EventCommands::Show { event } => app::show_event(app, event),
            EventCommands::List { search } => app::list_events(app, search.as_deref()),
            EventCommands::Update {
                event,
                role,
                expect_version,
                fields,
            } => app::update_event(
                app,
                role.parse::<Role>()?,
                event,
                expect_version,
                fields.into_fields()?,
            ),
            EventCommands::Delete { event, role } => {
                app::delete_event(app, role.parse::<Role>()?, event)
            }
        },
        Commands::Participant { command } => match command {
            ParticipantCommands::Add {
                first_name,
                last_name,
                email,
                phone,
                identifier,
            } => app::add_participant(
                app,
                NewParticipant {
                    first_name,
                    last_name,
                    email,
                    phone,
                    identifier: identifier.unwrap_or_default(),
                },
            ),
            ParticipantCommands::List => app::list_participants(app),
        },
        Commands::Register {
            event,
            participant,
            status,
        } => app::register(
            app,
            event,
            participant,
            status.parse::<RegistrationStatus>()?,
        ),
        Commands::Unregister { event, participant } => app::unregister(app, event, participant),
        Commands::BatchRegister {
            event,
            participants,
            timeout_secs,
        } => app::batch_register(
            app,
            event,
            &participants,
            Duration::from_secs(timeout_secs),
        ),
        Commands::Roster { event } => app::roster(app, event),
        Commands::Completion { .. } | Commands::Man { .. } => Ok(()),
    }
}

//! taskweave CLI entry point.

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use log::info;
use std::fs;
use std::time::Duration;

mod cli;

use cli::{Cli, Command, TeamCommand};
use taskweave::config::Config;
use taskweave::coordination::{MessageType, NotificationBus, TeamManager, render_injection};
use taskweave::executor::{BackgroundExecutor, BackgroundStatus};
use taskweave::task::{TaskId, TaskPatch, TaskStatus, TaskSummary};
use taskweave::task_manager::{TaskManager, UpdateOutcome};

fn setup_logging(config: &Config, verbose: bool) -> Result<()> {
    let log_dir = config.log_dir();
    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("taskweave.log");

    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    let level = if verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    setup_logging(&config, cli.verbose).context("Failed to setup logging")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cli.command, config))
}

async fn run(command: Command, config: Config) -> Result<()> {
    let manager = TaskManager::from_config(&config).context("Failed to open task store")?;

    match command {
        Command::Create {
            subject,
            description,
            active_form,
            blocked_by,
        } => {
            let task = manager.create_task(&subject, &description, active_form.as_deref())?;
            println!("{} Created task #{}: {}", "✓".green(), task.id, task.subject);
            if !blocked_by.is_empty() {
                let patch = TaskPatch::new().add_blocked_by(blocked_by.iter().map(String::as_str));
                let outcome = manager.update(&task.id, &patch)?;
                println!("  {}", outcome.task.summary().render_line());
            }
        }
        Command::Show { id } => {
            println!("{}", manager.render_task(&task_id(&id))?);
        }
        Command::List => {
            let tasks = manager.list_tasks()?;
            if tasks.is_empty() {
                println!("No tasks.");
            }
            for task in &tasks {
                print_line(task);
            }
            let counts = manager.task_counts()?;
            if counts.total() > 0 {
                println!(
                    "\n{} pending, {} in progress, {} completed",
                    counts.pending, counts.in_progress, counts.completed
                );
            }
        }
        Command::Ready => {
            let ready = manager.ready_tasks()?;
            if ready.is_empty() {
                println!("Nothing is ready.");
            }
            for task in &ready {
                print_line(&task.summary());
            }
        }
        Command::Blocked => {
            let blocked = manager.blocked_tasks()?;
            if blocked.is_empty() {
                println!("Nothing is blocked.");
            }
            for task in &blocked {
                print_line(&task.summary());
            }
        }
        Command::Start { id, owner } => {
            let mut patch = TaskPatch::new().status(TaskStatus::InProgress);
            if let Some(owner) = owner {
                patch = patch.owner(owner);
            }
            let outcome = manager.update(&task_id(&id), &patch)?;
            if !outcome.task.is_executable() {
                println!("{} Task #{} is still blocked", "!".yellow(), outcome.task.id);
            }
            print_outcome(&outcome);
        }
        Command::Complete { id } => {
            let outcome = manager.set_status(&task_id(&id), TaskStatus::Completed)?;
            print_outcome(&outcome);
        }
        Command::Reopen { id } => {
            let outcome = manager.set_status(&task_id(&id), TaskStatus::Pending)?;
            print_outcome(&outcome);
        }
        Command::Depend { task, prerequisites } => {
            let patch = TaskPatch::new().add_blocked_by(prerequisites.iter().map(String::as_str));
            print_outcome(&manager.update(&task_id(&task), &patch)?);
        }
        Command::Undepend { task, prerequisites } => {
            let patch = TaskPatch::new().remove_blocked_by(prerequisites.iter().map(String::as_str));
            print_outcome(&manager.update(&task_id(&task), &patch)?);
        }
        Command::Delete { id } => {
            let id = task_id(&id);
            let unblocked = manager.delete_task(&id)?;
            println!("{} Deleted task #{}", "✓".green(), id);
            print_unblocked(&unblocked);
        }
        Command::Check => {
            manager.verify()?;
            let counts = manager.task_counts()?;
            println!("{} {} task(s), all dependency edges consistent", "✓".green(), counts.total());
        }
        Command::Run { command, wait } => {
            run_background(&config, &command, wait).await?;
        }
        Command::Team(command) => run_team(&config, command)?,
    }

    Ok(())
}

async fn run_background(config: &Config, command: &str, wait: Option<u64>) -> Result<()> {
    let bus = NotificationBus::new();
    let executor = BackgroundExecutor::new(bus.clone(), config.background.clone());

    let id = executor.run_command(command, None)?;
    println!("{} Started background task {}", "→".blue(), id);

    let timeout = wait.map(Duration::from_millis).unwrap_or_else(|| config.background.default_wait());
    let snapshot = executor.get_output(&id, true, timeout).await?;

    if snapshot.status == BackgroundStatus::Running {
        // The worker thread dies with this process
        println!(
            "{} Still running after {}ms; exiting without waiting",
            "!".yellow(),
            timeout.as_millis()
        );
        return Ok(());
    }

    if let Some(block) = render_injection(&bus.drain()) {
        println!("{}", block);
    }
    if let Some(output) = snapshot.output {
        println!("\n{}", output);
    }
    Ok(())
}

fn run_team(config: &Config, command: TeamCommand) -> Result<()> {
    let teams = TeamManager::open(config.teams_dir(), &config.store).context("Failed to open teams directory")?;
    let me = config.agent_name.as_str();

    match command {
        TeamCommand::Create { name, members } => {
            teams.create_team(&name)?;
            let mut team = teams.add_member(&name, me)?;
            for member in &members {
                team = teams.add_member(&name, member)?;
            }
            println!("{} Created team {} with {} member(s)", "✓".green(), team.name, team.members.len());
        }
        TeamCommand::Delete { name } => {
            teams.delete_team(&name)?;
            println!("{} Deleted team {}", "✓".green(), name);
        }
        TeamCommand::Join { team, member } => {
            let team = teams.add_member(&team, &member)?;
            println!("{} {} is in team {} ({} member(s))", "✓".green(), member, team.name, team.members.len());
        }
        TeamCommand::Send { team, content, to, kind } => {
            let kind: MessageType = kind.parse()?;
            let recipients = teams.send_message(&team, me, to.as_deref(), kind, &content)?;
            println!("{} Sent {} to {}", "→".blue(), kind, recipients.join(", "));
        }
        TeamCommand::Inbox { team, member } => {
            let member = member.as_deref().unwrap_or(me);
            let messages = teams.check_inbox(&team, member)?;
            if messages.is_empty() {
                println!("No new messages.");
            }
            for message in &messages {
                println!("{}", message.render());
            }
        }
        TeamCommand::Status { team } => {
            println!("{}", teams.status(team.as_deref())?);
        }
    }
    Ok(())
}

fn task_id(raw: &str) -> TaskId {
    TaskId::from(raw)
}

fn print_line(task: &TaskSummary) {
    let line = task.render_line();
    match task.status {
        TaskStatus::Completed => println!("{}", line.dimmed()),
        TaskStatus::InProgress => println!("{}", line.yellow()),
        TaskStatus::Pending if !task.blocked_by.is_empty() => println!("{}", line.red()),
        TaskStatus::Pending => println!("{}", line),
    }
}

fn print_outcome(outcome: &UpdateOutcome) {
    println!("{} {}", "✓".green(), outcome.task.summary().render_line());
    print_unblocked(&outcome.unblocked);
}

fn print_unblocked(unblocked: &[TaskId]) {
    if !unblocked.is_empty() {
        let ids: Vec<String> = unblocked.iter().map(|id| format!("#{}", id)).collect();
        println!("{} Now unblocked: {}", "→".blue(), ids.join(", "));
    }
}

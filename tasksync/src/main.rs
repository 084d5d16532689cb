mod cli;

use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, bail};
use tasksync::config::Config;
use tasksync::session::AuthSession;
use tasksync::storage::SessionFile;
use tasksync::sync::feed::{ChangeFeed, PollingFeed};
use tasksync::sync::identity::{Identity, IdentityCell, IdentityProvider};
use tasksync::sync::memory::MemoryBackend;
use tasksync::sync::store::{RestStore, TaskStore};
use tasksync::sync::{NewTask, TaskSync, TaskView, ViewFilter};
use tasksync_core::{AuthClient, StoreClient, TASKS_TABLE, TaskPatch, TaskStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

use cli::{Command, USAGE, parse_cli, parse_command, split_words};

const OFFLINE_USER: &str = "local";

enum Account {
    Remote(Arc<AuthSession>),
    Local(IdentityCell),
}

struct App {
    engine: TaskSync,
    account: Account,
}

impl App {
    async fn online(config: &Config) -> anyhow::Result<Self> {
        let auth = AuthClient::new(config.url.as_str(), config.anon_key.clone())
            .context("invalid auth endpoint")?;
        let rows = StoreClient::new(config.url.as_str(), config.anon_key.clone())
            .context("invalid store endpoint")?;
        let session = Arc::new(AuthSession::new(
            auth,
            config.session_file.clone().map(SessionFile::new),
        ));
        if let Err(err) = session.restore().await {
            tracing::warn!(error = %err, "ignoring unreadable saved session");
        }

        let store: Arc<dyn TaskStore> = Arc::new(RestStore::new(rows, Arc::clone(&session)));
        let feed: Arc<dyn ChangeFeed> = Arc::new(PollingFeed::new(
            Arc::clone(&store),
            TASKS_TABLE,
            config.poll_interval,
        ));
        Ok(Self {
            engine: TaskSync::new(store, feed),
            account: Account::Remote(session),
        })
    }

    fn offline() -> Self {
        let backend = Arc::new(MemoryBackend::new());
        Self {
            engine: TaskSync::new(backend.clone(), backend),
            account: Account::Local(IdentityCell::new(Some(Identity::new(OFFLINE_USER)))),
        }
    }

    fn identity(&self) -> &dyn IdentityProvider {
        match &self.account {
            Account::Remote(session) => &**session,
            Account::Local(cell) => cell,
        }
    }

    /// Points the engine at whoever is signed in right now.
    async fn sync_owner(&self) {
        let wanted = self.identity().current().map(|identity| identity.id);
        if self.engine.owner() != wanted {
            self.engine.set_owner(wanted).await;
        }
    }

    async fn require_owner(&self) -> anyhow::Result<()> {
        self.sync_owner().await;
        if self.engine.owner().is_none() {
            bail!("not signed in; run `tasksync login <email> <password>` first");
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let cli = parse_cli(std::env::args())?;
    if cli.command == Command::Help {
        println!("{USAGE}");
        return Ok(());
    }
    let app = if cli.offline {
        App::offline()
    } else {
        App::online(&Config::from_env()?).await?
    };

    match cli.command {
        Command::Shell => shell(&app).await,
        command => execute(&app, command).await,
    }
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_env("TASKSYNC_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn execute(app: &App, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Login { email, password } => {
            match &app.account {
                Account::Remote(session) => {
                    session.sign_in(&email, &password).await?;
                }
                Account::Local(cell) => cell.set(Some(Identity {
                    id: email.clone(),
                    email: Some(email.clone()),
                })),
            }
            app.sync_owner().await;
            println!("signed in as {email}");
        }
        Command::Signup { email, password } => match &app.account {
            Account::Remote(session) => match session.sign_up(&email, &password).await? {
                Some(_) => {
                    app.sync_owner().await;
                    println!("account created, signed in as {email}");
                }
                None => println!("account created; confirm {email} before signing in"),
            },
            Account::Local(_) => bail!("signup needs the hosted backend"),
        },
        Command::Logout => {
            match &app.account {
                Account::Remote(session) => session.sign_out().await?,
                Account::Local(cell) => cell.set(None),
            }
            app.sync_owner().await;
            println!("signed out");
        }
        Command::List(filter) => {
            app.require_owner().await?;
            app.engine.set_filter(filter);
            print_view(&app.engine.view());
        }
        Command::Add { title, description } => {
            app.require_owner().await?;
            let task = app.engine.create(NewTask::new(title, description)).await?;
            println!("added {} {}", task.id, task.title);
        }
        Command::Done(id) => {
            app.require_owner().await?;
            let Some(task) = app
                .engine
                .update(&id, TaskPatch::status(TaskStatus::Completed))
                .await?
            else {
                bail!("no task with id {id}");
            };
            println!("completed {} {}", task.id, task.title);
            if task.needs_rating() {
                println!("how did it go? rate it with `tasksync rate {} <1-5>`", task.id);
            }
        }
        Command::Reopen(id) => {
            app.require_owner().await?;
            if app
                .engine
                .update(&id, TaskPatch::status(TaskStatus::Pending))
                .await?
                .is_none()
            {
                bail!("no task with id {id}");
            }
            println!("reopened {id}");
        }
        Command::Rate { id, rating } => {
            app.require_owner().await?;
            if app.engine.update(&id, TaskPatch::rating(rating)).await?.is_none() {
                bail!("no task with id {id}");
            }
            println!("rated {id} {rating}/5");
        }
        Command::Edit {
            id,
            title,
            description,
        } => {
            app.require_owner().await?;
            let mut patch = TaskPatch::default().with_title(title);
            if let Some(description) = description {
                patch = patch.with_description(description);
            }
            if app.engine.update(&id, patch).await?.is_none() {
                bail!("no task with id {id}");
            }
            println!("updated {id}");
        }
        Command::Remove(id) => {
            app.require_owner().await?;
            app.engine.delete(&id).await?;
            println!("deleted {id}");
        }
        Command::Watch(filter) => {
            app.require_owner().await?;
            app.engine.set_filter(filter);
            watch(app).await?;
        }
        Command::Help => println!("{USAGE}"),
        Command::Shell | Command::Quit => {}
    }
    Ok(())
}

async fn watch(app: &App) -> anyhow::Result<()> {
    let follower = app.engine.follow(app.identity());
    let mut changes = app.engine.changes();
    loop {
        let view = app.engine.view();
        if !view.loading {
            print_view(&view);
            println!();
        }
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    follower.abort();
    Ok(())
}

async fn shell(app: &App) -> anyhow::Result<()> {
    let follower = app.engine.follow(app.identity());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt();
    while let Some(line) = lines.next_line().await? {
        let parsed = split_words(&line).and_then(|words| {
            if words.is_empty() {
                Ok(None)
            } else {
                parse_command(&words).map(Some)
            }
        });
        match parsed {
            Ok(None) | Ok(Some(Command::Shell)) => {}
            Ok(Some(Command::Quit)) => break,
            Ok(Some(Command::Watch(_))) => eprintln!("watch is not available inside the shell"),
            Ok(Some(command)) => {
                if let Err(err) = execute(app, command).await {
                    eprintln!("error: {err:#}");
                }
            }
            Err(err) => eprintln!("error: {err:#}"),
        }
        prompt();
    }
    follower.abort();
    Ok(())
}

fn prompt() {
    print!("> ");
    // A prompt that fails to flush only delays its display.
    let _ = std::io::stdout().flush();
}

fn print_view(view: &TaskView) {
    if view.tasks.is_empty() {
        match view.filter {
            ViewFilter::All => println!("no tasks yet"),
            filter => println!("no {filter} tasks"),
        }
    }
    for task in &view.tasks {
        let mark = if task.is_completed() { 'x' } else { ' ' };
        let rating = task
            .rating
            .map(|rating| format!("  ({rating}/5)"))
            .unwrap_or_default();
        println!("[{mark}] {:<6} {}{rating}", task.id, task.title);
        if !task.description.is_empty() {
            println!("           {}", task.description);
        }
    }
    println!(
        "all: {}  pending: {}  completed: {}",
        view.counts.all, view.counts.pending, view.counts.completed
    );
}

use anyhow::{Context, bail};
use tasksync::sync::ViewFilter;

pub const USAGE: &str = "\
Usage: tasksync [--offline] [command]

Commands:
  login <email> <password>          Sign in and remember the session
  signup <email> <password>         Create an account
  logout                            Sign out and forget the session
  list [all|pending|completed]      Print tasks and counts
  add <title> [description]         Create a task
  done <id>                         Mark a task completed
  reopen <id>                       Mark a task pending again
  rate <id> <1-5>                   Rate a task
  edit <id> <title> [description]   Change title and description
  rm <id>                           Delete a task
  watch [filter]                    Print the list on every change until Ctrl-C
  shell                             Read commands from stdin (default)
  help                              Show this message

Options:
  --offline   Use an in-memory store instead of the hosted backend";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login { email: String, password: String },
    Signup { email: String, password: String },
    Logout,
    List(ViewFilter),
    Add { title: String, description: String },
    Done(String),
    Reopen(String),
    Rate { id: String, rating: u8 },
    Edit {
        id: String,
        title: String,
        description: Option<String>,
    },
    Remove(String),
    Watch(ViewFilter),
    Shell,
    Quit,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cli {
    pub offline: bool,
    pub command: Command,
}

pub fn parse_cli<I>(args: I) -> anyhow::Result<Cli>
where
    I: IntoIterator<Item = String>,
{
    let mut offline = false;
    let mut words = Vec::new();
    for arg in args.into_iter().skip(1) {
        match arg.as_str() {
            "--offline" if words.is_empty() => offline = true,
            "--help" | "-h" if words.is_empty() => words.push("help".to_string()),
            _ => words.push(arg),
        }
    }
    let command = if words.is_empty() {
        Command::Shell
    } else {
        parse_command(&words)?
    };
    Ok(Cli { offline, command })
}

pub fn parse_command(words: &[String]) -> anyhow::Result<Command> {
    let Some((name, args)) = words.split_first() else {
        bail!("empty command");
    };
    let args: Vec<&str> = args.iter().map(String::as_str).collect();
    let command = match (name.as_str(), args.as_slice()) {
        ("login", [email, password]) => Command::Login {
            email: email.to_string(),
            password: password.to_string(),
        },
        ("signup", [email, password]) => Command::Signup {
            email: email.to_string(),
            password: password.to_string(),
        },
        ("logout", []) => Command::Logout,
        ("list" | "ls", rest) => Command::List(parse_filter(rest)?),
        ("add", [title]) => Command::Add {
            title: title.to_string(),
            description: String::new(),
        },
        ("add", [title, description]) => Command::Add {
            title: title.to_string(),
            description: description.to_string(),
        },
        ("done", [id]) => Command::Done(id.to_string()),
        ("reopen", [id]) => Command::Reopen(id.to_string()),
        ("rate", [id, rating]) => Command::Rate {
            id: id.to_string(),
            rating: rating
                .parse()
                .with_context(|| format!("rating must be a number from 1 to 5, got {rating}"))?,
        },
        ("edit", [id, title]) => Command::Edit {
            id: id.to_string(),
            title: title.to_string(),
            description: None,
        },
        ("edit", [id, title, description]) => Command::Edit {
            id: id.to_string(),
            title: title.to_string(),
            description: Some(description.to_string()),
        },
        ("rm" | "delete", [id]) => Command::Remove(id.to_string()),
        ("watch", rest) => Command::Watch(parse_filter(rest)?),
        ("shell", []) => Command::Shell,
        ("quit" | "exit", []) => Command::Quit,
        ("help", _) => Command::Help,
        (
            "login" | "signup" | "logout" | "add" | "done" | "reopen" | "rate" | "edit" | "rm"
            | "delete" | "shell" | "quit" | "exit",
            _,
        ) => bail!("wrong number of arguments for `{name}`; see `tasksync help`"),
        (other, _) => bail!("unknown command: {other}"),
    };
    Ok(command)
}

fn parse_filter(args: &[&str]) -> anyhow::Result<ViewFilter> {
    match args {
        [] => Ok(ViewFilter::All),
        [value] => value.parse().map_err(anyhow::Error::msg),
        _ => bail!("expected at most one filter"),
    }
}

/// Splits a shell line into words. Single or double quotes group words.
pub fn split_words(line: &str) -> anyhow::Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_word = false;
    for ch in line.chars() {
        match quote {
            Some(open) if ch == open => quote = None,
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => {
                quote = Some(ch);
                in_word = true;
            }
            None if ch.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(ch);
                in_word = true;
            }
        }
    }
    if quote.is_some() {
        bail!("unterminated quote");
    }
    if in_word {
        words.push(current);
    }
    Ok(words)
}

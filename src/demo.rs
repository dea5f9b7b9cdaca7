//! Small command shell served by the demo binary.

use std::time::Duration;

use async_trait::async_trait;
use ssh_cli_server::server::{Error, Interact, Result, SessionContext};
use tracing::info;

const PROMPT: &str = "cli> ";
const MAX_SLEEP_SECS: u64 = 300;
const CTRL_C: u8 = 0x03;

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Help,
    Echo(&'a str),
    User,
    Sleep(u64),
    Exit,
    Shutdown,
    Empty,
    Unknown(&'a str),
    Invalid(String),
}

impl<'a> Command<'a> {
    fn parse(line: &'a str) -> Self {
        let line = line.trim();
        let (name, rest) = match line.split_once(char::is_whitespace) {
            Some((name, rest)) => (name, rest.trim()),
            None => (line, ""),
        };
        match name {
            "" => Command::Empty,
            "help" | "?" => Command::Help,
            "echo" => Command::Echo(rest),
            "user" | "whoami" => Command::User,
            "sleep" => match rest.parse::<u64>() {
                Ok(secs) if secs <= MAX_SLEEP_SECS => Command::Sleep(secs),
                Ok(_) => Command::Invalid(format!("sleep: at most {MAX_SLEEP_SECS} seconds")),
                Err(_) => Command::Invalid("usage: sleep <seconds>".to_string()),
            },
            "exit" | "quit" | "logout" => Command::Exit,
            "shutdown" => Command::Shutdown,
            other => Command::Unknown(other),
        }
    }
}

/// One instance per session.
#[derive(Default)]
pub struct DemoCli;

#[async_trait]
impl Interact for DemoCli {
    async fn interact(&self, mut session: SessionContext) -> Result<()> {
        let size = session.terminal_size();
        session
            .output()
            .writeln(&format!(
                "Welcome, {}. Terminal {}x{}. Type 'help' for commands.",
                session.username(),
                size.columns,
                size.rows
            ))
            .await;

        loop {
            session.output().write_str(PROMPT).await;
            let line = match session.read_line().await {
                Ok(Some(line)) => line,
                Ok(None) => {
                    session.output().writeln("logout").await;
                    return Ok(());
                }
                Err(Error::Interrupted) => {
                    session.interrupt().clear();
                    continue;
                }
                Err(e) => return Err(e),
            };

            match Command::parse(&line) {
                Command::Empty => {}
                Command::Help => {
                    session
                        .output()
                        .writeln("help | echo <text> | user | sleep <seconds> | exit | shutdown")
                        .await;
                }
                Command::Echo(text) => session.output().writeln(text).await,
                Command::User => {
                    let text = format!("{} from {}", session.username(), session.remote_addr());
                    session.output().writeln(&text).await;
                }
                Command::Sleep(secs) => sleep(&mut session, secs).await?,
                Command::Exit => return Ok(()),
                Command::Shutdown => {
                    info!(user = session.username(), "Shutdown requested from CLI");
                    session.output().writeln("server shutting down").await;
                    session.server().shutdown();
                    return Ok(());
                }
                Command::Unknown(name) => {
                    session
                        .output()
                        .writeln(&format!("{name}: unknown command"))
                        .await;
                }
                Command::Invalid(message) => session.output().writeln(&message).await,
            }
        }
    }
}

/// Sleep until the timer fires, Ctrl-C arrives, or the session is cancelled.
///
/// Other keystrokes typed meanwhile are discarded.
async fn sleep(session: &mut SessionContext, secs: u64) -> Result<()> {
    let interrupt = session.interrupt().clone();
    let deadline = tokio::time::sleep(Duration::from_secs(secs));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => return Ok(()),
            _ = interrupt.wait() => break,
            byte = session.input().read_byte() => {
                if byte? == CTRL_C {
                    break;
                }
            }
        }
    }

    interrupt.clear();
    session.output().writeln("^C").await;
    Ok(())
}

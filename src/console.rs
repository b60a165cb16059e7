//! Line-oriented console for driving a peer by hand.

use std::fmt::Write as _;

use peerboard::board::{BoardError, BoardId, Path};
use peerboard::replication::{EditOutcome, ReplicationController, ReplicationError};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::warn;

pub const HELP: &str = "\
commands:
  new                 create a board
  boards              list boards
  show <id>           print a board
  open <id>           mirror a remote board
  draw <id> <path>    add a path
  undo <id>           remove the last path
  clear <id>          remove every path
  share <id>          share an owned board
  unshare <id>        stop sharing an owned board
  delete <id>         delete a board (or stop mirroring it)
  quit                leave";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConsoleError {
    #[error("unknown command: {0} (try `help`)")]
    UnknownCommand(String),
    #[error("`{command}` needs <{argument}>")]
    MissingArgument { command: &'static str, argument: &'static str },
    #[error(transparent)]
    Board(#[from] BoardError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    New,
    Boards,
    Show(BoardId),
    Open(BoardId),
    Draw(BoardId, Path),
    Undo(BoardId),
    Clear(BoardId),
    Share(BoardId),
    Unshare(BoardId),
    Delete(BoardId),
    Quit,
}

/// Parse one input line. Blank lines yield `None`.
///
/// # Errors
///
/// Returns `ConsoleError` for an unknown command, a missing argument, or a
/// malformed board id or path.
pub fn parse(line: &str) -> Result<Option<Command>, ConsoleError> {
    let mut words = line.split_whitespace();
    let Some(name) = words.next() else {
        return Ok(None);
    };

    let command = match name {
        "help" | "?" => Command::Help,
        "new" => Command::New,
        "boards" | "ls" => Command::Boards,
        "show" => Command::Show(board(&mut words, "show")?),
        "open" => Command::Open(board(&mut words, "open")?),
        "draw" => {
            let id = board(&mut words, "draw")?;
            let raw = words
                .next()
                .ok_or(ConsoleError::MissingArgument { command: "draw", argument: "path" })?;
            Command::Draw(id, Path::new(raw)?)
        }
        "undo" => Command::Undo(board(&mut words, "undo")?),
        "clear" => Command::Clear(board(&mut words, "clear")?),
        "share" => Command::Share(board(&mut words, "share")?),
        "unshare" => Command::Unshare(board(&mut words, "unshare")?),
        "delete" | "rm" => Command::Delete(board(&mut words, "delete")?),
        "quit" | "exit" => Command::Quit,
        other => return Err(ConsoleError::UnknownCommand(other.to_owned())),
    };
    Ok(Some(command))
}

/// Run one command and render its result.
///
/// # Errors
///
/// Returns the controller's error for the failed operation.
pub async fn execute(controller: &ReplicationController, command: Command) -> Result<String, ReplicationError> {
    let reply = match command {
        Command::Help => HELP.to_owned(),
        Command::Quit => "bye".to_owned(),
        Command::New => controller.create_board().await?.to_string(),
        Command::Boards => {
            let mut out = String::new();
            for summary in controller.boards().await {
                match serde_json::to_string(&summary) {
                    Ok(json) => {
                        if writeln!(out, "{json}").is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!(board_id = %summary.id, error = %e, "summary not serializable"),
                }
            }
            out.trim_end().to_owned()
        }
        Command::Show(id) => {
            let board = controller
                .snapshot(&id)
                .await
                .ok_or_else(|| ReplicationError::NotFound(id.clone()))?;
            let listeners = controller.listener_count(&id).await;
            format!("{} (listeners: {listeners})", board.serialize())
        }
        Command::Open(id) => format!("mirroring {id} at version {}", controller.subscribe(&id).await?),
        Command::Draw(id, path) => {
            let base = current_version(controller, &id).await?;
            describe(controller.propose_path(&id, path, base).await?)
        }
        Command::Undo(id) => {
            let base = current_version(controller, &id).await?;
            describe(controller.propose_undo(&id, base).await?)
        }
        Command::Clear(id) => {
            let base = current_version(controller, &id).await?;
            describe(controller.propose_clear(&id, base).await?)
        }
        Command::Share(id) => toggled(controller.set_shared(&id, true).await?, "shared"),
        Command::Unshare(id) => toggled(controller.set_shared(&id, false).await?, "unshared"),
        Command::Delete(id) => {
            controller.delete_board(&id).await?;
            format!("deleted {id}")
        }
    };
    Ok(reply)
}

/// Read commands from `input` until `quit` or end of input.
///
/// # Errors
///
/// Returns an I/O error if reading `input` fails.
pub async fn run<R>(controller: &ReplicationController, input: R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let command = match parse(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("error: {e}");
                continue;
            }
        };
        let quit = command == Command::Quit;
        match execute(controller, command).await {
            Ok(reply) => println!("{reply}"),
            Err(e) => println!("error: {e}"),
        }
        if quit {
            break;
        }
    }
    Ok(())
}

fn board<'a>(words: &mut impl Iterator<Item = &'a str>, command: &'static str) -> Result<BoardId, ConsoleError> {
    let raw = words.next().ok_or(ConsoleError::MissingArgument { command, argument: "id" })?;
    Ok(raw.parse()?)
}

async fn current_version(controller: &ReplicationController, id: &BoardId) -> Result<u64, ReplicationError> {
    controller
        .snapshot(id)
        .await
        .map(|board| board.version())
        .ok_or_else(|| ReplicationError::NotFound(id.clone()))
}

fn describe(outcome: EditOutcome) -> String {
    match outcome {
        EditOutcome::Accepted { version } => format!("accepted at version {version}"),
        EditOutcome::Rejected { current } => format!("rejected; board is at version {current}"),
        EditOutcome::Forwarded => "forwarded to owner".to_owned(),
    }
}

fn toggled(changed: bool, state: &str) -> String {
    if changed { state.to_owned() } else { format!("already {state}") }
}

#[cfg(test)]
#[path = "console_test.rs"]
mod tests;

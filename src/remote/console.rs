//! Interactive console
//!
//! Line-oriented stand-in for the app screen: each line of stdin is a button
//! press or lifecycle signal, and selection updates are printed as they come.

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

use crate::connection::ConnectionEvent;
use crate::error::{Error, Result};
use crate::protocol::{Command, Led};

use super::RemoteController;

pub const HELP: &str = "\
Commands:
  up | down | stop        send that command
  select [L1..L4|ALL]     select an LED (no argument: tap)
  all                     select ALL (long press)
  fg | foreground         resume heartbeat, reconnect if needed
  bg | background         pause heartbeat, cancel pending reconnect
  status                  show connection state and selection
  help                    show this help
  quit | exit             disconnect and exit";

/// One parsed console line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsoleCommand {
    Send(Command, Option<Led>),
    Foreground,
    Background,
    Status,
    Help,
    Quit,
}

/// Parse a console line. Blank lines yield `None`.
pub fn parse_line(line: &str) -> Result<Option<ConsoleCommand>> {
    let mut words = line.split_whitespace();
    let Some(word) = words.next() else {
        return Ok(None);
    };
    let argument = words.next();
    if let Some(extra) = words.next() {
        return Err(Error::malformed(format!("unexpected argument '{}'", extra)));
    }

    let command = match word.to_lowercase().as_str() {
        "select" => ConsoleCommand::Send(Command::Select, argument.map(str::parse::<Led>).transpose()?),
        "all" => ConsoleCommand::Send(Command::Select, Some(Led::All)),
        "fg" | "foreground" => ConsoleCommand::Foreground,
        "bg" | "background" => ConsoleCommand::Background,
        "status" => ConsoleCommand::Status,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => ConsoleCommand::Send(other.parse()?, None),
    };

    if argument.is_some() && !matches!(command, ConsoleCommand::Send(Command::Select, _)) {
        return Err(Error::malformed(format!("'{}' takes no argument", word)));
    }

    Ok(Some(command))
}

/// LED panel as text, e.g. `L1 [ ]  L2 [x]  L3 [ ]  L4 [ ]`
pub fn render_panel(controller: &RemoteController) -> String {
    Led::OUTPUTS
        .iter()
        .map(|led| {
            let mark = if controller.is_selected(*led) { 'x' } else { ' ' };
            format!("{} [{}]", led, mark)
        })
        .collect::<Vec<_>>()
        .join("  ")
}

fn print_status(controller: &RemoteController) {
    println!(
        "state: {}  selected: {}  {}",
        controller.connection_state(),
        controller.selected().unwrap_or("-"),
        render_panel(controller)
    );
}

fn execute(controller: &mut RemoteController, command: ConsoleCommand) -> Result<()> {
    match command {
        ConsoleCommand::Send(command, led) => controller.send_command(command, led)?,
        ConsoleCommand::Foreground => controller.foreground()?,
        ConsoleCommand::Background => controller.background()?,
        ConsoleCommand::Status => print_status(controller),
        ConsoleCommand::Help => println!("{}", HELP),
        ConsoleCommand::Quit => {}
    }
    Ok(())
}

/// Run the console until quit, EOF or Ctrl-C
pub async fn run_console(mut controller: RemoteController) -> Result<()> {
    controller.start()?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Shutdown signal received");
                break;
            }

            line = lines.next_line() => match line? {
                Some(line) => match parse_line(&line) {
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Ok(Some(command)) => execute(&mut controller, command)?,
                    Ok(None) => {}
                    Err(e) => eprintln!("{} (type 'help' for commands)", e),
                },
                None => {
                    debug!("stdin closed");
                    break;
                }
            },

            event = controller.next_event() => match event {
                Some(ConnectionEvent::StateChanged(state)) => {
                    info!(state = %state, "Connection state changed");
                    println!("state: {}", state);
                }
                Some(ConnectionEvent::Message(token)) => {
                    println!("selected: {}  {}", token, render_panel(&controller));
                }
                None => {
                    warn!("Connection manager stopped unexpectedly");
                    break;
                }
            },
        }
    }

    controller.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Option<ConsoleCommand> {
        parse_line(line).unwrap()
    }

    #[test]
    fn test_parse_plain_commands() {
        assert_eq!(parse("up"), Some(ConsoleCommand::Send(Command::Up, None)));
        assert_eq!(parse("  DOWN "), Some(ConsoleCommand::Send(Command::Down, None)));
        assert_eq!(parse("stop"), Some(ConsoleCommand::Send(Command::Stop, None)));
    }

    #[test]
    fn test_parse_select_forms() {
        assert_eq!(parse("select"), Some(ConsoleCommand::Send(Command::Select, None)));
        assert_eq!(parse("select l2"), Some(ConsoleCommand::Send(Command::Select, Some(Led::L2))));
        assert_eq!(parse("all"), Some(ConsoleCommand::Send(Command::Select, Some(Led::All))));
        assert!(parse_line("select L9").is_err());
    }

    #[test]
    fn test_parse_lifecycle_and_control() {
        assert_eq!(parse("fg"), Some(ConsoleCommand::Foreground));
        assert_eq!(parse("background"), Some(ConsoleCommand::Background));
        assert_eq!(parse("status"), Some(ConsoleCommand::Status));
        assert_eq!(parse("help"), Some(ConsoleCommand::Help));
        assert_eq!(parse("EXIT"), Some(ConsoleCommand::Quit));
    }

    #[test]
    fn test_parse_blank_and_invalid() {
        assert_eq!(parse("   "), None);
        assert!(parse_line("jump").is_err());
        assert!(parse_line("up L1").is_err());
        assert!(parse_line("select L1 L2").is_err());
    }

    #[test]
    fn test_help_lists_every_command() {
        for command in Command::ALL {
            assert!(HELP.contains(command.as_str()));
        }
    }
}

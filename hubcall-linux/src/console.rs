//! Line-oriented terminal controller: stdin commands in, call events out.

use hubcall_core::{CallEvent, RosterSnapshot};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};

use crate::driver::{Intent, Output, Status};

const HELP: &str = "\
commands:
  login <name>      register a display name
  users             list online users
  call <name>       call a user
  accept | decline  answer the ringing call
  hangup            end the current call
  mute | unmute     microphone
  volume <0-100>    playback volume
  status            show call state
  quit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Intent(Intent),
    Users,
    Status,
    Help,
    Quit,
}

pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(cmd) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<&str> = words.collect();
    let arg = |what: &str| match rest.as_slice() {
        [] => Err(format!("usage: {cmd} <{what}>")),
        words => Ok(words.join(" ")),
    };
    let parsed = match cmd.to_ascii_lowercase().as_str() {
        "login" | "register" => ConsoleCommand::Intent(Intent::Register(arg("name")?)),
        "users" | "ls" => ConsoleCommand::Users,
        "call" | "dial" => ConsoleCommand::Intent(Intent::Dial(arg("name")?)),
        "accept" | "answer" => ConsoleCommand::Intent(Intent::Accept),
        "decline" | "reject" => ConsoleCommand::Intent(Intent::Decline),
        "hangup" | "end" => ConsoleCommand::Intent(Intent::HangUp),
        "mute" => ConsoleCommand::Intent(Intent::SetMuted(true)),
        "unmute" => ConsoleCommand::Intent(Intent::SetMuted(false)),
        "volume" | "vol" => {
            let v = arg("0-100")?;
            let percent = v
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= 100)
                .ok_or_else(|| format!("volume must be 0-100, got {v:?}"))?;
            ConsoleCommand::Intent(Intent::SetVolume(percent))
        }
        "status" => ConsoleCommand::Status,
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(format!("unknown command {other:?} (try help)")),
    };
    Ok(Some(parsed))
}

pub fn describe(output: &Output) -> String {
    match output {
        Output::Rejected(e) => format!("! {e}"),
        Output::Event(ev) => match ev {
            CallEvent::StateChanged(s) => format!("* call {s}"),
            CallEvent::IncomingCall(call) => format!(
                "* incoming call from {} (accept / decline)",
                call.from.display_name
            ),
            CallEvent::CallEnded { reason, .. } => format!("* call ended: {reason}"),
            CallEvent::RosterChanged(roster) => format!("* {} user(s) online", roster.len()),
            CallEvent::Registered(name) => format!("* registered as {name}"),
        },
    }
}

pub fn describe_roster(roster: &RosterSnapshot) -> String {
    if roster.is_empty() {
        return "no one else is online".to_string();
    }
    roster
        .iter()
        .map(|p| format!("  {}", p.display_name))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn describe_status(s: &Status) -> String {
    let mut out = format!(
        "name: {}  hub: {}  call: {}",
        s.name.as_deref().unwrap_or("-"),
        if s.connected { "connected" } else { "offline" },
        s.state,
    );
    if let Some(peer) = &s.peer {
        out.push_str(&format!(" with {peer}"));
    }
    if let Some(id) = &s.call_id {
        out.push_str(&format!(" [{id}]"));
    }
    out.push_str(&format!(
        "  mic: {}  volume: {}%",
        if s.muted { "muted" } else { "on" },
        s.volume
    ));
    out
}

/// Read commands until quit or EOF. Dropping `intents` on return stops the driver.
pub async fn run_console(
    intents: mpsc::UnboundedSender<Intent>,
    mut outputs: mpsc::UnboundedReceiver<Output>,
    roster: watch::Receiver<RosterSnapshot>,
    status: watch::Receiver<Status>,
) -> std::io::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{HELP}");
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Ok(None) => {}
                    Ok(Some(ConsoleCommand::Intent(intent))) => {
                        if intents.send(intent).is_err() {
                            break;
                        }
                    }
                    Ok(Some(ConsoleCommand::Users)) => {
                        println!("{}", describe_roster(&roster.borrow()));
                        let _ = intents.send(Intent::RefreshRoster);
                    }
                    Ok(Some(ConsoleCommand::Status)) => println!("{}", describe_status(&status.borrow())),
                    Ok(Some(ConsoleCommand::Help)) => println!("{HELP}"),
                    Ok(Some(ConsoleCommand::Quit)) => break,
                    Err(msg) => println!("! {msg}"),
                }
            }
            Some(out) = outputs.recv() => println!("{}", describe(&out)),
        }
    }
    Ok(())
}

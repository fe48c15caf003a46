//! Colored console lines for a running conversation

use colloquy::{ExchangeLog, Role};

const GREEN: &str = "\x1b[1;32;40m";
const RED: &str = "\x1b[1;31;40m";
const WHITE: &str = "\x1b[1;37;40m";

/// Console lines for one completed round, in the order they happened
pub fn render_round(role: Role, log: &ExchangeLog) -> Vec<String> {
    log.iter()
        .enumerate()
        .map(|(step, message)| {
            // The Talker sends on step 0, the Listener on step 1
            let sent = (step == 0) == role.speaks_first();
            match (role, sent) {
                (Role::Talker, true) => format!("{GREEN}{}:{}", role.node(), message),
                (Role::Talker, false) => format!(
                    "{RED}{}:(Msg from {}): {}",
                    role.node(),
                    role.peer().node(),
                    message
                ),
                (Role::Listener, true) => format!("{}:{}", role.node(), message),
                (Role::Listener, false) => format!(
                    "{}:(Msg from {}): {}",
                    role.node(),
                    role.peer().node(),
                    message
                ),
            }
        })
        .collect()
}

pub fn print_round(role: Role, log: &ExchangeLog) {
    for line in render_round(role, log) {
        println!("{line}");
    }
}

pub fn closing_line() -> String {
    format!("{WHITE} Closing Connection")
}

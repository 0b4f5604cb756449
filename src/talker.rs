//! Talker - a small multi-user chat served through the bridge
//!
//! Each visitor first picks a name, then can talk to everyone else.
//!
//! | Command | Action |
//! |---------|--------|
//! | say <text>, '<text> | Send text to everyone else |
//! | who | List who is connected |
//! | secret | Read one line with echo off |
//! | char | Character mode until `q` is pressed |
//! | help | Show commands |

use std::collections::BTreeMap;
use std::net::SocketAddr;

use tracing::{debug, info};
use unicode_width::UnicodeWidthStr;

use crate::config::TalkerConfig;
use crate::core::session::ConnId;
use crate::net::{EndpointConfig, Host, InputModes, Link, Outbox};

const NAME_PROMPT: &str = "Name: ";
const SECRET_PROMPT: &str = "Secret: ";

/// A connected member as seen by everyone else
struct Member {
    link: Link,
    name: Option<String>,
    addr: SocketAddr,
}

/// Per-connection user state
#[derive(Debug)]
pub struct Visitor {
    link: Link,
    name: Option<String>,
    modes: InputModes,
    prompt: String,
}

/// Chat host
pub struct Talker {
    title: String,
    prompt: String,
    motd: String,
    members: BTreeMap<ConnId, Member>,
}

impl Talker {
    pub fn new(config: &TalkerConfig) -> Self {
        Self {
            title: config.name.clone(),
            prompt: config.prompt.clone(),
            motd: config.motd.clone(),
            members: BTreeMap::new(),
        }
    }

    /// Columns taken by the widest prompt this host shows
    pub fn prompt_width(&self) -> u16 {
        let widest = [NAME_PROMPT, SECRET_PROMPT, self.prompt.as_str()]
            .iter()
            .map(|p| p.width())
            .max()
            .unwrap_or(0);
        u16::try_from(widest).unwrap_or(u16::MAX)
    }

    /// Number of connected visitors
    #[allow(dead_code)]
    pub fn count(&self) -> usize {
        self.members.len()
    }

    /// Send `text` to every named member except `from`
    fn broadcast(&self, from: ConnId, text: &str, out: &mut Outbox) {
        for member in self.members.values() {
            if member.link.conn != from && member.name.is_some() {
                out.send(&member.link, text);
            }
        }
    }

    fn who(&self) -> String {
        let mut text = format!("{} visitor(s) on {}:\r\n", self.members.len(), self.title);
        for member in self.members.values() {
            let name = member.name.as_deref().unwrap_or("(logging in)");
            text.push_str(&format!("  {:<16} {}\r\n", name, member.addr));
        }
        text
    }

    fn choose_name(&mut self, user: &mut Visitor, input: &str, out: &mut Outbox) {
        if input.is_empty() || input.contains(char::is_whitespace) {
            out.send(&user.link, "Please pick a single word.\r\n");
            return;
        }

        let name = input.to_string();
        info!("Connection {} is now {}", user.link.conn, name);
        if let Some(member) = self.members.get_mut(&user.link.conn) {
            member.name = Some(name.clone());
        }
        self.broadcast(user.link.conn, &format!("{} has arrived.\r\n", name), out);
        out.send(&user.link, format!("Hello, {}! Type 'help' for commands.\r\n", name));
        user.name = Some(name);
        user.prompt = self.prompt.clone();
    }

    fn command(&mut self, user: &mut Visitor, input: &str, out: &mut Outbox) {
        let name = user.name.clone().unwrap_or_default();
        let (verb, rest) = match input.strip_prefix('\'') {
            Some(text) => ("say", text.trim()),
            None => {
                let (verb, rest) = input.split_once(' ').unwrap_or((input, ""));
                (verb, rest.trim())
            }
        };

        match verb {
            "" => {}
            "say" if rest.is_empty() => out.send(&user.link, "Say what?\r\n"),
            "say" => {
                self.broadcast(user.link.conn, &format!("[{}] {}\r\n", name, rest), out);
                out.send(&user.link, format!("You say: {}\r\n", rest));
            }
            "who" => out.send(&user.link, self.who()),
            "secret" => {
                user.modes.insert(InputModes::NO_ECHO);
                user.prompt = SECRET_PROMPT.to_string();
            }
            "char" => {
                user.modes.insert(InputModes::SINGLE_CHAR);
                out.send(&user.link, "Character mode, press q to leave.\r\n");
            }
            "help" => out.send(
                &user.link,
                "Commands: say <text>, '<text>, who, secret, char, help\r\n",
            ),
            other => out.send(&user.link, format!("Unknown command: {}\r\n", other)),
        }
    }

    fn keypress(&mut self, user: &mut Visitor, input: &[u8], out: &mut Outbox) {
        if input.contains(&b'q') {
            user.modes.remove(InputModes::SINGLE_CHAR);
            out.send(&user.link, "\r\nLine mode.\r\n");
        } else {
            out.send(&user.link, format!("\r\n[key {:?}]\r\n", String::from_utf8_lossy(input)));
        }
    }
}

impl Host for Talker {
    type User = Visitor;

    fn new_user(&mut self, _endpoint: &EndpointConfig, link: Link, addr: SocketAddr) -> Visitor {
        info!("New visitor on connection {} from {}", link.conn, addr);
        self.members.insert(
            link.conn,
            Member {
                link: link.clone(),
                name: None,
                addr,
            },
        );
        Visitor {
            link,
            name: None,
            modes: InputModes::empty(),
            prompt: NAME_PROMPT.to_string(),
        }
    }

    fn on_logon(&mut self, user: &mut Visitor, out: &mut Outbox) {
        out.send(&user.link, format!("{}\r\n", self.motd));
        out.send(&user.link, &user.prompt);
    }

    fn on_line(&mut self, user: &mut Visitor, line: &[u8], out: &mut Outbox) {
        if user.modes.contains(InputModes::SINGLE_CHAR) {
            self.keypress(user, line, out);
            out.send(&user.link, &user.prompt);
            return;
        }

        let text = String::from_utf8_lossy(line);
        let input = text.trim_end_matches(['\r', '\n']).trim();
        debug!("Connection {}: {:?}", user.link.conn, input);

        if user.modes.contains(InputModes::NO_ECHO) {
            user.modes.remove(InputModes::NO_ECHO);
            user.prompt = self.prompt.clone();
            out.send(
                &user.link,
                format!("\r\nSecret received ({} characters).\r\n", input.chars().count()),
            );
        } else if user.name.is_none() {
            self.choose_name(user, input, out);
        } else {
            self.command(user, input, out);
        }
        out.send(&user.link, &user.prompt);
    }

    fn remove_interactive(&mut self, user: Visitor, destructive: bool, out: &mut Outbox) {
        info!(
            "Visitor on connection {} left (destructive {})",
            user.link.conn, destructive
        );
        self.members.remove(&user.link.conn);
        if let Some(name) = user.name {
            self.broadcast(user.link.conn, &format!("{} has left.\r\n", name), out);
        }
    }

    fn modes(&self, user: &Visitor) -> InputModes {
        user.modes
    }

    fn prompt<'a>(&'a self, user: &'a Visitor) -> &'a str {
        &user.prompt
    }
}

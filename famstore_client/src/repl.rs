//! Interactive REPL-style command-line interface client.

use std::io::{self, Write};
use std::str::SplitWhitespace;

use color_print::{cprint, cprintln};

use tokio::time::Instant;

use famstore::{ControlClient, FamstoreError, MessageId};

/// Prompt string at the start of line.
const PROMPT: &str = ">>>>> ";

/// Recognizable command types.
#[derive(Debug, PartialEq, Eq)]
pub enum ReplCommand {
    /// Protocol line to send to the leader.
    Normal(String),

    /// Print help message.
    PrintHelp,

    /// Client exit.
    Exit,

    /// Nothing read.
    Nothing,
}

/// Interactive REPL-style client struct.
pub struct ClientRepl {
    /// Connection to the leader.
    client: ControlClient,

    /// User input buffer.
    input_buf: String,
}

impl ClientRepl {
    /// Creates a new REPL-style client.
    pub fn new(client: ControlClient) -> Self {
        ClientRepl {
            client,
            input_buf: String::new(),
        }
    }

    /// Prints the prompt string.
    #[inline]
    fn print_prompt() -> Result<(), FamstoreError> {
        cprint!("<bright-yellow>{}</>", PROMPT);
        io::stdout().flush()?;
        Ok(())
    }

    /// Prints (optionally) an error message and the help message.
    fn print_help(err: Option<&FamstoreError>) -> Result<(), FamstoreError> {
        if let Some(e) = err {
            cprintln!("<bright-red>✗</> {}", e);
        }
        println!("HELP: Supported commands are:");
        println!("          set <id> <text>");
        println!("          get <id>");
        println!("          help");
        println!("          exit");
        println!("      IDs are 32-bit signed integers; text runs to end of line");
        io::stdout().flush()?;
        Ok(())
    }

    /// Expect to get the next segment as a message ID.
    #[inline]
    fn expect_id(segs: &mut SplitWhitespace) -> Result<MessageId, FamstoreError> {
        match segs.next() {
            Some(seg) => Ok(seg.parse::<MessageId>()?),
            None => Err(FamstoreError::msg("not enough args")),
        }
    }

    /// Parses one line of user input into a command.
    pub fn parse_input(line: &str) -> Result<ReplCommand, FamstoreError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(ReplCommand::Nothing);
        }

        // split input line by whitespaces, getting an iterator of segments
        let mut segs = line.split_whitespace();
        let Some(cmd_type) = segs.next() else {
            return Ok(ReplCommand::Nothing);
        };

        // match command type case-insensitively
        match &cmd_type.to_lowercase()[..] {
            "get" => {
                let id = Self::expect_id(&mut segs)?;
                Ok(ReplCommand::Normal(format!("GET {}", id)))
            }

            "set" => {
                let id = Self::expect_id(&mut segs)?;
                // text keeps its inner spacing, so take it from the raw line
                let text = line[cmd_type.len()..]
                    .trim_start()
                    .split_once(char::is_whitespace)
                    .map(|(_, text)| text.trim())
                    .unwrap_or_default();
                if text.is_empty() {
                    return Err(FamstoreError::msg("not enough args"));
                }
                Ok(ReplCommand::Normal(format!("SET {} {}", id, text)))
            }

            "help" => Ok(ReplCommand::PrintHelp),

            "exit" | "quit" => Ok(ReplCommand::Exit),

            _ => Err(FamstoreError::msg(format!(
                "unrecognized command: {}",
                cmd_type
            ))),
        }
    }

    /// Reads in user input and parses into a command.
    fn read_command(&mut self) -> Result<ReplCommand, FamstoreError> {
        self.input_buf.clear();
        let nread = io::stdin().read_line(&mut self.input_buf)?;
        if nread == 0 {
            return Ok(ReplCommand::Exit);
        }
        Self::parse_input(&self.input_buf)
    }

    /// Prints a reply line from the leader.
    pub fn print_reply(reply: &str, elapsed_ms: f64) -> Result<(), FamstoreError> {
        if reply == "NOT_FOUND" {
            cprintln!("<bright-cyan>✗</> not found <<took {:.2} ms>>", elapsed_ms);
        } else if reply == "ERROR" || reply.starts_with("ERROR ") {
            cprintln!("<bright-red>✗</> {} <<took {:.2} ms>>", reply, elapsed_ms);
        } else {
            cprintln!("<bright-green>✓</> {} <<took {:.2} ms>>", reply, elapsed_ms);
        }
        io::stdout().flush()?;
        Ok(())
    }

    /// Sends a protocol line and prints the reply.
    pub async fn eval_line(&mut self, line: &str) -> Result<(), FamstoreError> {
        let start = Instant::now();
        let reply = self.client.send_line(line).await?;
        Self::print_reply(&reply, start.elapsed().as_secs_f64() * 1000.0)
    }

    /// One iteration of the REPL loop.
    async fn iter(&mut self) -> Result<bool, FamstoreError> {
        Self::print_prompt()?;

        let cmd = match self.read_command() {
            Ok(cmd) => cmd,
            Err(e) => {
                Self::print_help(Some(&e))?;
                return Ok(true);
            }
        };
        match cmd {
            ReplCommand::Exit => {
                println!("Exiting...");
                Ok(false)
            }

            ReplCommand::Nothing => Ok(true),

            ReplCommand::PrintHelp => {
                Self::print_help(None)?;
                Ok(true)
            }

            ReplCommand::Normal(line) => {
                self.eval_line(&line).await?;
                Ok(true)
            }
        }
    }

    /// Runs the REPL loop until exit or until the leader goes away.
    pub async fn run(&mut self) -> Result<(), FamstoreError> {
        println!("Connected to leader at {}", self.client.leader());
        while self.iter().await? {}
        Ok(())
    }
}

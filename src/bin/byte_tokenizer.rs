//! # byte_tokenizer — reference tokenizer worker
//!
//! Speaks the worker line protocol on stdin/stdout with a byte-level
//! vocabulary: id 0 is padding, 1 end-of-sequence, 2 unknown, and byte `b`
//! maps to `b + 3`. `TOKENIZE` appends end-of-sequence; `DETOKENIZE` skips
//! special ids.
//!
//! ## Usage
//!
//! ```bash
//! byte_tokenizer                       # normal worker
//! byte_tokenizer --startup-delay-ms 500
//! byte_tokenizer --fail-startup        # report a startup error and exit
//! byte_tokenizer --crash-on PANIC      # exit without replying if input contains PANIC
//! byte_tokenizer --hang-on SLOW        # never reply if input contains SLOW
//! byte_tokenizer --reply-delay-ms 300  # answer every request late
//! ```
//!
//! The last four exist so the pool's failure handling can be exercised
//! against a real process.

use std::io::{self, BufRead, Write};
use std::time::Duration;
use tokio_completion_orchestrator::model::TokenId;
use tokio_completion_orchestrator::pool::{Command, WorkerRequest, WorkerResponse};

const PAD: TokenId = 0;
const EOS: TokenId = 1;
const UNK: TokenId = 2;
const BYTE_OFFSET: TokenId = 3;
const VOCAB_SIZE: TokenId = 256 + BYTE_OFFSET;

/// Parsed CLI arguments.
#[derive(Default)]
struct Args {
    fail_startup: bool,
    startup_delay_ms: u64,
    crash_on: Option<String>,
    hang_on: Option<String>,
    reply_delay_ms: u64,
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args::default();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--fail-startup" => parsed.fail_startup = true,
            "--startup-delay-ms" => {
                i += 1;
                let value = args.get(i).ok_or("--startup-delay-ms requires a value")?;
                parsed.startup_delay_ms = value
                    .parse()
                    .map_err(|_| format!("invalid delay: {value}"))?;
            }
            "--reply-delay-ms" => {
                i += 1;
                let value = args.get(i).ok_or("--reply-delay-ms requires a value")?;
                parsed.reply_delay_ms = value
                    .parse()
                    .map_err(|_| format!("invalid delay: {value}"))?;
            }
            "--crash-on" => {
                i += 1;
                parsed.crash_on = Some(args.get(i).ok_or("--crash-on requires a value")?.clone());
            }
            "--hang-on" => {
                i += 1;
                parsed.hang_on = Some(args.get(i).ok_or("--hang-on requires a value")?.clone());
            }
            other => return Err(format!("unknown argument: {other}")),
        }
        i += 1;
    }
    Ok(parsed)
}

fn tokenize(text: &str) -> Vec<TokenId> {
    text.bytes()
        .map(|b| TokenId::from(b) + BYTE_OFFSET)
        .chain(std::iter::once(EOS))
        .collect()
}

fn detokenize(tokens: &[TokenId]) -> String {
    let bytes: Vec<u8> = tokens
        .iter()
        .filter(|&&t| t >= BYTE_OFFSET && t < VOCAB_SIZE)
        .filter_map(|&t| u8::try_from(t - BYTE_OFFSET).ok())
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn write_line(out: &mut impl Write, response: &WorkerResponse) -> io::Result<()> {
    let line = serde_json::to_string(response).map_err(io::Error::other)?;
    writeln!(out, "{line}")?;
    out.flush()
}

fn run(args: &Args) -> io::Result<i32> {
    let stdout = io::stdout();
    let mut out = stdout.lock();

    if args.startup_delay_ms > 0 {
        std::thread::sleep(Duration::from_millis(args.startup_delay_ms));
    }
    if args.fail_startup {
        write_line(&mut out, &WorkerResponse::error(None, "simulated startup failure"))?;
        return Ok(1);
    }
    write_line(
        &mut out,
        &WorkerResponse::ready(format!(
            "byte vocabulary loaded (vocab_size={VOCAB_SIZE}, pad={PAD}, eos={EOS}, unk={UNK})"
        )),
    )?;

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let request: WorkerRequest = match serde_json::from_str(&line) {
            Ok(r) => r,
            Err(e) => {
                write_line(&mut out, &WorkerResponse::error(None, format!("bad request: {e}")))?;
                continue;
            }
        };
        let id = request.id.clone();
        if args.reply_delay_ms > 0 && request.command != Command::Shutdown {
            std::thread::sleep(Duration::from_millis(args.reply_delay_ms));
        }

        let response = match request.command {
            Command::Tokenize => match request.text {
                Some(text) => {
                    if args.crash_on.as_deref().is_some_and(|m| text.contains(m)) {
                        eprintln!("crash marker seen, exiting");
                        return Ok(3);
                    }
                    if args.hang_on.as_deref().is_some_and(|m| text.contains(m)) {
                        eprintln!("hang marker seen, going silent");
                        loop {
                            std::thread::sleep(Duration::from_secs(3600));
                        }
                    }
                    WorkerResponse::ok(id, serde_json::json!(tokenize(&text)))
                }
                None => WorkerResponse::error(Some(id), "TOKENIZE requires text"),
            },
            Command::Detokenize => match request.tokens {
                Some(tokens) => WorkerResponse::ok(id, serde_json::json!(detokenize(&tokens))),
                None => WorkerResponse::error(Some(id), "DETOKENIZE requires tokens"),
            },
            Command::Ping => WorkerResponse::ok(id, serde_json::json!("pong")),
            Command::Shutdown => {
                write_line(&mut out, &WorkerResponse::ok(id, serde_json::json!("bye")))?;
                return Ok(0);
            }
        };
        write_line(&mut out, &response)?;
    }
    Ok(0)
}

fn main() {
    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("byte_tokenizer: {msg}");
            std::process::exit(2);
        }
    };
    match run(&args) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("byte_tokenizer: {e}");
            std::process::exit(1);
        }
    }
}

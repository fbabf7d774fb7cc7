use std::{env, process};

use anyhow::{bail, Context, Result};
use env_logger::Env;
use log::{error, info};
use nix::unistd::{getpid, Pid};
use syscall_tamper::{End, SyscallNames, Tamper, Tracer};

/// Tamper rules used when `-t` is not given.
const RULES_ENV: &str = "SYSCALL_TAMPER_RULES";

const USAGE: &str = "Usage: syscall-tamper [-q] [-t RULES] (-p PID | COMMAND [ARGS...])";

#[derive(Debug, Default)]
struct Config {
    quiet: bool,
    rules: Option<String>,
    pid: Option<Pid>,
    command: Vec<String>,
}

impl Config {
    fn from_args(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut config = Config::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-q" => config.quiet = true,
                "-t" => config.rules = Some(args.next().context("-t needs a rule")?),
                "-p" => {
                    let pid = args.next().context("-p needs a pid")?;
                    let pid = pid.parse().with_context(|| format!("invalid pid {:?}", pid))?;
                    config.pid = Some(Pid::from_raw(pid));
                }
                "--" => {
                    config.command.extend(args.by_ref());
                }
                _ => {
                    config.command.push(arg);
                    config.command.extend(args.by_ref());
                }
            }
        }

        if config.rules.is_none() {
            config.rules = env::var(RULES_ENV).ok();
        }
        match (config.pid, config.command.is_empty()) {
            (Some(_), false) => bail!("give either a pid or a command, not both"),
            (None, true) => bail!("nothing to trace"),
            _ => Ok(config),
        }
    }
}

fn run(config: Config) -> Result<i32> {
    let mut tamper = Tamper::new(SyscallNames);
    tamper
        .parse(config.rules.as_deref().unwrap_or_default())
        .context("could not parse tamper rules")?;

    let mut tracer = match config.pid {
        Some(pid) => Tracer::attach(pid),
        None => {
            let (command, args) = config
                .command
                .split_first()
                .context("nothing to trace")?;
            Tracer::spawn(command, args, config.quiet)?
        }
    };

    tracer
        .on_attach(|pid| info!("tracing {}", pid))
        .on_detach(|pid| info!("done tracing {}", pid))
        .on_syscall_enter(move |call| tamper.delay(call))
        .on_syscall_exit(|call| info!("{}", call))
        .on_signal(|sig| info!("[{}] --- {} ---", sig.pid, sig.signal))
        .on_process_exit(|code| info!("+++ exited with {} +++", code));

    let end = tracer
        .start()
        .with_context(|| format!("tracing {} failed", tracer.pid()))?;
    Ok(match end {
        End::Exited(code) => code,
        End::Interrupted(sig) => 128 + sig as i32,
    })
}

fn main() {
    let logger_env = Env::default().default_filter_or("info");
    env_logger::Builder::from_env(logger_env).init();

    info!("started with pid {}", getpid());

    let config = match Config::from_args(env::args().skip(1)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}\n{USAGE}");
            process::exit(2);
        }
    };

    match run(config) {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Config> {
        Config::from_args(args.iter().map(|arg| arg.to_string()))
    }

    #[test]
    fn command_keeps_its_own_flags() {
        let config = parse(&["-q", "-t", "read", "ls", "-q", "/tmp"]).unwrap();
        assert!(config.quiet);
        assert_eq!(config.rules.as_deref(), Some("read"));
        assert_eq!(config.command, vec!["ls", "-q", "/tmp"]);
    }

    #[test]
    fn attaches_by_pid() {
        let config = parse(&["-p", "1234"]).unwrap();
        assert_eq!(config.pid, Some(Pid::from_raw(1234)));
        assert!(config.command.is_empty());
    }

    #[test]
    fn rejects_ambiguous_targets() {
        assert!(parse(&["-p", "1", "ls"]).is_err());
        assert!(parse(&["-q"]).is_err());
        assert!(parse(&["-p", "abc"]).is_err());
    }
}

//! Line commands typed on stdin while the bridge runs

use crate::service::ServiceCommand;
use anyhow::{anyhow, bail, Context, Result};
use brainosc_simulation::{SignalPattern, StreamCommand, StreamConfig};
use std::io::BufRead;
use std::str::FromStr;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub const HELP: &str = "commands: start | stop | reset | status | rate <hz> | out <expr> | \
pattern <name> | board-rate <hz> | noise <uV> | disconnect | reconnect | pause | resume | \
patterns | quit";

/// One parsed console line
#[derive(Debug, Clone)]
pub enum ConsoleCommand {
    Service(ServiceCommand),
    Board(StreamCommand),
    /// Change the synthetic board's sampling rate
    BoardRate(f64),
    /// Change the synthetic board's gaussian noise level
    Noise(f64),
    Help,
    ListPatterns,
}

/// Look up a preset pattern by name, ignoring case, spaces and dashes
pub fn find_pattern(name: &str) -> Option<SignalPattern> {
    let normalize = |s: &str| {
        s.chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_lowercase)
            .collect::<String>()
    };
    let wanted = normalize(name);
    SignalPattern::presets()
        .into_iter()
        .find(|(preset, _)| normalize(preset) == wanted)
        .map(|(_, pattern)| pattern)
}

impl FromStr for ConsoleCommand {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let line = line.trim();
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };

        let command = match word.to_ascii_lowercase().as_str() {
            "start" => ConsoleCommand::Service(ServiceCommand::Start),
            "stop" => ConsoleCommand::Service(ServiceCommand::Stop),
            "reset" => ConsoleCommand::Service(ServiceCommand::Reset),
            "status" => ConsoleCommand::Service(ServiceCommand::Status),
            "quit" | "exit" => ConsoleCommand::Service(ServiceCommand::Shutdown),
            "rate" => {
                let rate = rest
                    .parse::<f64>()
                    .with_context(|| format!("'{}' is not a rate in Hz", rest))?;
                ConsoleCommand::Service(ServiceCommand::SetTargetRate(rate))
            }
            "out" => {
                if rest.is_empty() {
                    bail!("usage: out <expr>, e.g. 'out *' or 'out chan1 fft_chan1'");
                }
                ConsoleCommand::Service(ServiceCommand::SetOutbound(rest.to_string()))
            }
            "pattern" => {
                let pattern =
                    find_pattern(rest).ok_or_else(|| anyhow!("unknown pattern '{}'", rest))?;
                ConsoleCommand::Board(StreamCommand::UpdatePattern(pattern))
            }
            "board-rate" => {
                let rate = rest
                    .parse::<f64>()
                    .with_context(|| format!("'{}' is not a rate in Hz", rest))?;
                ConsoleCommand::BoardRate(rate)
            }
            "noise" => {
                let std = rest
                    .parse::<f64>()
                    .with_context(|| format!("'{}' is not a noise level", rest))?;
                ConsoleCommand::Noise(std)
            }
            "patterns" => ConsoleCommand::ListPatterns,
            "disconnect" => ConsoleCommand::Board(StreamCommand::Disconnect),
            "reconnect" => ConsoleCommand::Board(StreamCommand::Reconnect),
            "pause" => ConsoleCommand::Board(StreamCommand::Pause),
            "resume" => ConsoleCommand::Board(StreamCommand::Resume),
            "help" | "?" => ConsoleCommand::Help,
            other => bail!("unknown command '{}'", other),
        };
        Ok(command)
    }
}

/// Board settings as the console last sent them
#[derive(Debug)]
pub struct BoardSettings {
    current: StreamConfig,
}

impl BoardSettings {
    pub fn new(current: StreamConfig) -> Self {
        Self { current }
    }

    /// Translate a console command into a board command, tracking the
    /// settings it implies. Invalid changes leave the settings untouched.
    pub fn command_for(&mut self, command: ConsoleCommand) -> Result<Option<StreamCommand>> {
        let mut next = self.current.clone();
        match command {
            ConsoleCommand::Board(StreamCommand::UpdatePattern(pattern)) => {
                self.current.board.pattern = pattern;
                return Ok(Some(StreamCommand::UpdatePattern(pattern)));
            }
            ConsoleCommand::Board(command) => return Ok(Some(command)),
            ConsoleCommand::BoardRate(rate) => next.board.sampling_rate = rate,
            ConsoleCommand::Noise(std) => next.board.noise.gaussian_std = std,
            _ => return Ok(None),
        }
        next.validate().context("board settings rejected")?;
        self.current = next.clone();
        Ok(Some(StreamCommand::UpdateConfig(next)))
    }
}

/// Read commands from stdin on a plain thread until stdin closes or the
/// service goes away
pub fn spawn(
    service: mpsc::Sender<ServiceCommand>,
    board: mpsc::Sender<StreamCommand>,
    mut settings: BoardSettings,
) -> std::io::Result<std::thread::JoinHandle<()>> {
    std::thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<ConsoleCommand>() {
                    Ok(ConsoleCommand::Service(command)) => {
                        if service.blocking_send(command).is_err() {
                            break;
                        }
                    }
                    Ok(ConsoleCommand::Help) => info!("{}", HELP),
                    Ok(ConsoleCommand::ListPatterns) => {
                        for (name, pattern) in SignalPattern::presets() {
                            info!(pattern = name, "{}", pattern.description());
                        }
                    }
                    Ok(command) => match settings.command_for(command) {
                        Ok(Some(command)) => {
                            if board.blocking_send(command).is_err() {
                                warn!("synthetic board is no longer running");
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("{:#}", e),
                    },
                    Err(e) => warn!("{:#}; {}", e, HELP),
                }
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_service_commands() {
        assert!(matches!(
            "start".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Service(ServiceCommand::Start)
        ));
        assert!(matches!(
            "  QUIT ".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Service(ServiceCommand::Shutdown)
        ));
        match "rate 125".parse::<ConsoleCommand>().unwrap() {
            ConsoleCommand::Service(ServiceCommand::SetTargetRate(rate)) => assert_eq!(rate, 125.0),
            other => panic!("unexpected {:?}", other),
        }
        match "out chan1  fft_chan2".parse::<ConsoleCommand>().unwrap() {
            ConsoleCommand::Service(ServiceCommand::SetOutbound(expr)) => {
                assert_eq!(expr, "chan1  fft_chan2")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_board_commands() {
        assert!(matches!(
            "pattern sleep-spindles".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Board(StreamCommand::UpdatePattern(SignalPattern::Bursts { .. }))
        ));
        assert!(matches!(
            "disconnect".parse::<ConsoleCommand>().unwrap(),
            ConsoleCommand::Board(StreamCommand::Disconnect)
        ));
    }

    #[test]
    fn test_parse_errors() {
        assert!("rate fast".parse::<ConsoleCommand>().is_err());
        assert!("out".parse::<ConsoleCommand>().is_err());
        assert!("pattern nonsense".parse::<ConsoleCommand>().is_err());
        assert!("launch".parse::<ConsoleCommand>().is_err());
    }

    #[test]
    fn test_board_settings_track_updates() {
        let mut settings = BoardSettings::new(StreamConfig::default());

        let command = settings.command_for("board-rate 500".parse().unwrap()).unwrap();
        match command {
            Some(StreamCommand::UpdateConfig(config)) => {
                assert_eq!(config.board.sampling_rate, 500.0);
            }
            other => panic!("unexpected {:?}", other),
        }

        settings.command_for("pattern focused".parse().unwrap()).unwrap();
        match settings.command_for("noise 0.5".parse().unwrap()).unwrap() {
            Some(StreamCommand::UpdateConfig(config)) => {
                assert_eq!(config.board.noise.gaussian_std, 0.5);
                assert_eq!(config.board.sampling_rate, 500.0);
                assert_eq!(Some(config.board.pattern), find_pattern("focused"));
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(settings.command_for("board-rate -1".parse().unwrap()).is_err());
        assert!(settings.command_for("noise -2".parse().unwrap()).is_err());
        assert!(matches!(
            settings.command_for("reconnect".parse().unwrap()).unwrap(),
            Some(StreamCommand::Reconnect)
        ));
    }

    #[test]
    fn test_find_pattern_normalizes_names() {
        assert_eq!(find_pattern("Eyes Closed"), find_pattern("eyes-closed"));
        assert!(find_pattern("sweep 1-40 hz").is_some());
        assert!(find_pattern("").is_none());
    }
}

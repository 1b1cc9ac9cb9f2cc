// src/commands.rs
//! Operator commands typed into `mtdr monitor`, one per line.
use std::path::PathBuf;
use std::str::FromStr;

use crate::drivers::{ConsoleError, CursorAxis, AVERAGING_FACTORS};
use crate::types::DisplayMode;

// 控制台发给引擎的命令
#[derive(Clone, Debug, PartialEq)]
pub enum OperatorCommand {
    Pause,
    Resume,
    Clear,
    Averaging(usize),
    Preset(String),
    /// Enable acquisition if the instrument is configured and idle.
    Start,
    ToggleAcquisition,
    ToggleLed,
    Mode(DisplayMode),
    ToggleCursor(CursorAxis, usize),
    MoveCursors { x_ps: f64, value: f64 },
    Save(Option<PathBuf>),
    Import(PathBuf),
    Plot(Option<PathBuf>),
    Connect,
    Disconnect,
    Status,
    Help,
    Quit,
}

pub fn help() -> String {
    let modes: Vec<&str> = DisplayMode::ALL.iter().map(|mode| mode.name()).collect();
    format!(
        "commands:\n\
         \x20 pause | resume | clear\n\
         \x20 avg <{factors}>\n\
         \x20 preset <alias>      e.g. 16/1, 32ns/2ps\n\
         \x20 start | acq | led\n\
         \x20 mode <{modes}>\n\
         \x20 cursor <v1|v2|h1|h2>\n\
         \x20 move <x_ps> <value>\n\
         \x20 save [file.csv] | import <file.csv> | plot [file.png]\n\
         \x20 connect | disconnect | status | help | quit",
        factors = AVERAGING_FACTORS.map(|f| f.to_string()).join("|"),
        modes = modes.join("|"),
    )
}

fn cursor(name: &str) -> Option<(CursorAxis, usize)> {
    match name.to_ascii_lowercase().as_str() {
        "v1" => Some((CursorAxis::Vertical, 0)),
        "v2" => Some((CursorAxis::Vertical, 1)),
        "h1" => Some((CursorAxis::Horizontal, 0)),
        "h2" => Some((CursorAxis::Horizontal, 1)),
        _ => None,
    }
}

fn number<T: FromStr>(word: &str) -> Result<T, ConsoleError> {
    word.parse()
        .map_err(|_| ConsoleError::Config(format!("'{word}' is not a number")))
}

impl FromStr for OperatorCommand {
    type Err = ConsoleError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let Some((verb, args)) = words.split_first() else {
            return Err(ConsoleError::Config("empty command".into()));
        };
        let command = match (verb.to_ascii_lowercase().as_str(), args) {
            ("pause", []) => OperatorCommand::Pause,
            ("resume", []) => OperatorCommand::Resume,
            ("clear", []) => OperatorCommand::Clear,
            ("avg" | "averaging", [factor]) => OperatorCommand::Averaging(number(factor)?),
            ("preset", [alias]) => OperatorCommand::Preset((*alias).to_owned()),
            ("start", []) => OperatorCommand::Start,
            ("acq" | "acquisition", []) => OperatorCommand::ToggleAcquisition,
            ("led", []) => OperatorCommand::ToggleLed,
            ("mode", [mode]) => {
                OperatorCommand::Mode(mode.parse().map_err(ConsoleError::Config)?)
            }
            ("cursor", [name]) => {
                let (axis, index) = cursor(name).ok_or_else(|| {
                    ConsoleError::Config(format!("unknown cursor '{name}' (v1, v2, h1 or h2)"))
                })?;
                OperatorCommand::ToggleCursor(axis, index)
            }
            ("move", [x_ps, value]) => OperatorCommand::MoveCursors {
                x_ps: number(x_ps)?,
                value: number(value)?,
            },
            ("save", []) => OperatorCommand::Save(None),
            ("save", [path]) => OperatorCommand::Save(Some(PathBuf::from(path))),
            ("import", [path]) => OperatorCommand::Import(PathBuf::from(path)),
            ("plot", []) => OperatorCommand::Plot(None),
            ("plot", [path]) => OperatorCommand::Plot(Some(PathBuf::from(path))),
            ("connect", []) => OperatorCommand::Connect,
            ("disconnect", []) => OperatorCommand::Disconnect,
            ("status", []) => OperatorCommand::Status,
            ("help" | "?", []) => OperatorCommand::Help,
            ("quit" | "exit" | "q", []) => OperatorCommand::Quit,
            _ => {
                return Err(ConsoleError::Config(format!(
                    "unrecognized command '{}' (type help)",
                    line.trim()
                )))
            }
        };
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> OperatorCommand {
        line.parse().unwrap()
    }

    #[test]
    fn parses_operator_lines() {
        assert_eq!(parse("pause"), OperatorCommand::Pause);
        assert_eq!(parse("  AVG 16 "), OperatorCommand::Averaging(16));
        assert_eq!(
            parse("preset 32ns/2ps"),
            OperatorCommand::Preset("32ns/2ps".into())
        );
        assert_eq!(
            parse("mode impedance-log"),
            OperatorCommand::Mode(DisplayMode::ImpedanceLog)
        );
        assert_eq!(
            parse("cursor H2"),
            OperatorCommand::ToggleCursor(CursorAxis::Horizontal, 1)
        );
        assert_eq!(
            parse("move 1500 0.6"),
            OperatorCommand::MoveCursors {
                x_ps: 1500.0,
                value: 0.6
            }
        );
        assert_eq!(parse("save"), OperatorCommand::Save(None));
        assert_eq!(
            parse("import run1.csv"),
            OperatorCommand::Import(PathBuf::from("run1.csv"))
        );
        assert_eq!(parse("q"), OperatorCommand::Quit);
    }

    #[test]
    fn malformed_lines_are_config_errors() {
        for line in ["", "avg", "avg many", "mode ohms", "cursor v3", "move 1", "pause now"] {
            let err = line.parse::<OperatorCommand>().unwrap_err();
            assert!(matches!(err, ConsoleError::Config(_)), "{line}: {err}");
        }
    }

    #[test]
    fn help_lists_every_mode_and_factor() {
        let text = help();
        for mode in DisplayMode::ALL {
            assert!(text.contains(mode.name()));
        }
        assert!(text.contains("1|2|4|8|16|32|64|128"));
    }
}

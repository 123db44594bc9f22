// FILE: src\audio_engine\command.rs
// ==================================

use super::song_part::LoopAction;
use crate::error::LooperError;
use std::str::FromStr;

/// Everything the engine can be asked to do. Text form is `name arg...`,
/// as sent by the MIDI note table or typed on stdin.
#[derive(Debug, Clone, PartialEq)]
pub enum LooperCommand {
    PlayPart(usize),
    RecordNewLayer,
    UndoLayer,
    RedoLayer,
    UndoLoop,
    RedoLoop,
    ChangeLoop(LoopAction),
    PauseAndClear,
    StopSong,
    ClearPart,
    DuplicatePart,
    CycleDrumLevel,
    DrumEnding(Option<f64>),
    SilenceDrum,
    DrumVolume(i32),
    DrumSwing(i32),
    DrumKit(i32),
    LoadDrumKit,
    SetDrumLength(usize),
    SaveSong,
    SaveNewSong,
    LoadSong,
    ChangeSong(i32),
    DeleteSong,
}

fn bad(command: &str, reason: impl Into<String>) -> LooperError {
    LooperError::BadArgument {
        command: command.to_string(),
        reason: reason.into(),
    }
}

fn required<'a>(command: &str, arg: Option<&'a str>) -> Result<&'a str, LooperError> {
    arg.ok_or_else(|| bad(command, "missing argument"))
}

fn parse_arg<T: FromStr>(command: &str, arg: &str) -> Result<T, LooperError> {
    arg.parse()
        .map_err(|_| bad(command, format!("cannot parse '{}'", arg)))
}

/// Parses a `+1`/`-1` style step.
fn parse_step(command: &str, arg: Option<&str>) -> Result<i32, LooperError> {
    let step: i32 = parse_arg(command, required(command, arg)?)?;
    if step == 0 {
        return Err(bad(command, "step must not be zero"));
    }
    Ok(step)
}

impl FromStr for LooperCommand {
    type Err = LooperError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let name = words
            .next()
            .ok_or_else(|| LooperError::UnknownCommand(String::new()))?;
        let arg = words.next();
        if words.next().is_some() {
            return Err(bad(name, "too many arguments"));
        }

        let command = match name {
            "play_part" => LooperCommand::PlayPart(parse_arg(name, required(name, arg)?)?),
            "record_layer" => LooperCommand::RecordNewLayer,
            "undo_layer" => LooperCommand::UndoLayer,
            "redo_layer" => LooperCommand::RedoLayer,
            "undo_loop" => LooperCommand::UndoLoop,
            "redo_loop" => LooperCommand::RedoLoop,
            "loop" => LooperCommand::ChangeLoop(required(name, arg)?.parse()?),
            "pause_and_clear" => LooperCommand::PauseAndClear,
            "stop" => LooperCommand::StopSong,
            "clear_part" => LooperCommand::ClearPart,
            "duplicate_part" => LooperCommand::DuplicatePart,
            "drum_level" => LooperCommand::CycleDrumLevel,
            "drum_ending" => {
                let bars = match arg {
                    Some(a) => {
                        let bars: f64 = parse_arg(name, a)?;
                        if !(bars > 0.0 && bars.is_finite()) {
                            return Err(bad(name, "bars must be positive"));
                        }
                        Some(bars)
                    }
                    None => None,
                };
                LooperCommand::DrumEnding(bars)
            }
            "drum_silence" => LooperCommand::SilenceDrum,
            "drum_volume" => LooperCommand::DrumVolume(parse_step(name, arg)?),
            "drum_swing" => LooperCommand::DrumSwing(parse_step(name, arg)?),
            "drum_kit" => LooperCommand::DrumKit(parse_step(name, arg)?),
            "load_drum_kit" => LooperCommand::LoadDrumKit,
            "drum_length" => {
                LooperCommand::SetDrumLength(parse_arg(name, required(name, arg)?)?)
            }
            "save_song" => LooperCommand::SaveSong,
            "save_new_song" => LooperCommand::SaveNewSong,
            "load_song" => LooperCommand::LoadSong,
            "song" => LooperCommand::ChangeSong(parse_step(name, arg)?),
            "delete_song" => LooperCommand::DeleteSong,
            other => return Err(LooperError::UnknownCommand(other.to_string())),
        };

        let takes_arg = matches!(
            command,
            LooperCommand::PlayPart(_)
                | LooperCommand::ChangeLoop(_)
                | LooperCommand::DrumEnding(_)
                | LooperCommand::DrumVolume(_)
                | LooperCommand::DrumSwing(_)
                | LooperCommand::DrumKit(_)
                | LooperCommand::SetDrumLength(_)
                | LooperCommand::ChangeSong(_)
        );
        if !takes_arg && arg.is_some() {
            return Err(bad(name, "takes no argument"));
        }
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_commands_with_arguments() {
        assert_eq!("play_part 2".parse(), Ok(LooperCommand::PlayPart(2)));
        assert_eq!(
            "loop delete".parse(),
            Ok(LooperCommand::ChangeLoop(LoopAction::Delete))
        );
        assert_eq!("drum_volume -1".parse(), Ok(LooperCommand::DrumVolume(-1)));
        assert_eq!("song +1".parse(), Ok(LooperCommand::ChangeSong(1)));
        assert_eq!(
            "drum_length 88200".parse(),
            Ok(LooperCommand::SetDrumLength(88200))
        );
        assert_eq!("drum_ending 0.5".parse(), Ok(LooperCommand::DrumEnding(Some(0.5))));
        assert_eq!("drum_ending".parse(), Ok(LooperCommand::DrumEnding(None)));
        assert_eq!("  stop  ".parse(), Ok(LooperCommand::StopSong));
    }

    #[test]
    fn unknown_names_are_reported() {
        assert_eq!(
            "explode".parse::<LooperCommand>(),
            Err(LooperError::UnknownCommand("explode".into()))
        );
        assert!(matches!(
            "".parse::<LooperCommand>(),
            Err(LooperError::UnknownCommand(_))
        ));
    }

    #[test]
    fn bad_arguments_are_reported() {
        for text in [
            "play_part",
            "play_part x",
            "play_part -1",
            "loop sideways",
            "drum_volume 0",
            "drum_ending -2",
            "stop now",
            "song 1 2",
        ] {
            assert!(
                matches!(
                    text.parse::<LooperCommand>(),
                    Err(LooperError::BadArgument { .. })
                ),
                "{text}"
            );
        }
    }
}

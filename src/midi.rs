use crate::audio_engine::command::LooperCommand;
use anyhow::Result;
use midir::{Ignore, MidiInput, MidiInputConnection, MidiInputPort};
use std::collections::BTreeMap;
use std::sync::mpsc::Sender;

const APP_NAME: &str = "barloop";

pub fn get_midi_ports() -> Result<Vec<(String, MidiInputPort)>> {
    let midi_in = MidiInput::new(APP_NAME)?;
    let ports = midi_in.ports();
    let mut result = Vec::with_capacity(ports.len());
    for port in ports.iter() {
        let name = midi_in.port_name(port)?;
        result.push((name, port.clone()));
    }
    Ok(result)
}

/// Keeps the note table entries that parse as commands. Bad entries are
/// logged and skipped.
pub fn parse_note_map(note_map: &BTreeMap<u8, String>) -> BTreeMap<u8, String> {
    note_map
        .iter()
        .filter(|(note, line)| match line.parse::<LooperCommand>() {
            Ok(_) => true,
            Err(e) => {
                log::warn!("Ignoring MIDI note {}: {}", note, e);
                false
            }
        })
        .map(|(note, line)| (*note, line.clone()))
        .collect()
}

/// Command line mapped to a note-on message, if any. Note-on with zero
/// velocity is a note-off.
pub fn note_command<'a>(message: &[u8], note_map: &'a BTreeMap<u8, String>) -> Option<&'a str> {
    if message.len() < 3 {
        return None;
    }
    let is_note_on = message[0] & 0xF0 == 0x90 && message[2] > 0;
    if !is_note_on {
        return None;
    }
    note_map.get(&message[1]).map(String::as_str)
}

/// Opens the first MIDI input whose name contains `port_substring` and sends
/// the command line of every mapped note-on to `command_sender`.
pub fn connect_midi(
    port_substring: &str,
    note_map: &BTreeMap<u8, String>,
    command_sender: Sender<String>,
) -> Result<MidiInputConnection<()>> {
    let mut midi_in = MidiInput::new(APP_NAME)?;
    midi_in.ignore(Ignore::All);

    let (port_name, port) = get_midi_ports()?
        .into_iter()
        .find(|(name, _)| name.contains(port_substring))
        .ok_or_else(|| anyhow::anyhow!("MIDI port not found: {}", port_substring))?;
    log::info!("Opening MIDI connection to: {}", port_name);

    let note_map = parse_note_map(note_map);
    let conn = midi_in
        .connect(
            &port,
            "barloop-midi-in",
            move |_stamp, message, _| {
                if let Some(line) = note_command(message, &note_map) {
                    command_sender.send(line.to_string()).ok();
                }
            },
            (),
        )
        .map_err(|e| anyhow::anyhow!("Failed to connect to MIDI port {}: {}", port_name, e))?;
    Ok(conn)
}

use std::time::Duration;

use async_trait::async_trait;
use enigo::{Direction, Enigo, Key, Keyboard, Settings};
use tracing::{debug, warn};

use crate::input::{Chord, InputError, KeyInput, Modifier, bounded};

const MODIFIER_SETTLE: Duration = Duration::from_millis(10);
/// A chord takes a few milliseconds; anything longer means the display
/// connection is wedged.
const CHORD_TIMEOUT: Duration = Duration::from_secs(2);

fn modifier_key(modifier: Modifier) -> Key {
    match modifier {
        Modifier::Control => Key::Control,
        Modifier::Meta => Key::Meta,
        Modifier::Alt => Key::Alt,
        Modifier::Shift => Key::Shift,
    }
}

/// Simulates key chords through enigo. Each chord gets a fresh connection on a
/// blocking worker thread so no platform handle has to cross threads.
#[derive(Debug, Default, Clone)]
pub struct EnigoInput;

impl EnigoInput {
    pub fn new() -> Self {
        Self
    }

    /// Opens a connection once to confirm keystroke simulation is available.
    pub fn probe() -> Result<(), InputError> {
        Enigo::new(&Settings::default())
            .map(|_| ())
            .map_err(|err| InputError::Initialization(err.to_string()))
    }

    fn press_chord(chord: &Chord) -> Result<(), InputError> {
        let mut enigo = Enigo::new(&Settings::default())
            .map_err(|err| InputError::Initialization(err.to_string()))?;

        let mut pressed = Vec::with_capacity(chord.modifiers.len());
        let mut outcome = Ok(());
        for modifier in &chord.modifiers {
            let key = modifier_key(*modifier);
            if let Err(err) = enigo.key(key, Direction::Press) {
                outcome = Err(InputError::Keyboard(err.to_string()));
                break;
            }
            pressed.push(key);
        }

        if outcome.is_ok() {
            std::thread::sleep(MODIFIER_SETTLE);
            outcome = enigo
                .key(Key::Unicode(chord.key), Direction::Click)
                .map_err(|err| InputError::Keyboard(err.to_string()));
        }

        // Modifiers are released even when the click failed so none stay stuck.
        for key in pressed.into_iter().rev() {
            if let Err(err) = enigo.key(key, Direction::Release) {
                warn!("failed to release modifier {key:?}: {err}");
                if outcome.is_ok() {
                    outcome = Err(InputError::Keyboard(err.to_string()));
                }
            }
        }

        outcome
    }
}

#[async_trait]
impl KeyInput for EnigoInput {
    async fn send_chord(&self, chord: &Chord) -> Result<(), InputError> {
        let owned = chord.clone();
        bounded("key chord", CHORD_TIMEOUT, async {
            tokio::task::spawn_blocking(move || Self::press_chord(&owned))
                .await
                .map_err(|err| InputError::Worker(err.to_string()))?
        })
        .await?;

        debug!(chord = %chord, "key chord sent");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modifiers_map_to_enigo_keys() {
        assert_eq!(modifier_key(Modifier::Control), Key::Control);
        assert_eq!(modifier_key(Modifier::Meta), Key::Meta);
        assert_eq!(modifier_key(Modifier::Alt), Key::Alt);
        assert_eq!(modifier_key(Modifier::Shift), Key::Shift);
    }
}

//! Default xkb keymap for the virtual keyboard, plus modifier tracking for
//! the keys replayed through it.

use std::{fs::File, io::Write, os::fd::AsFd};

use input_event::KeyState;
use xkbcommon::xkb;

use crate::error::KeymapError;

// evdev key codes are offset by 8 in xkb keycode space
const EVDEV_OFFSET: u32 = 8;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Modifiers {
    pub depressed: u32,
    pub latched: u32,
    pub locked: u32,
    pub group: u32,
}

pub(crate) struct Keymap {
    state: xkb::State,
    modifiers: Modifiers,
    file: File,
    size: u32,
}

impl Keymap {
    /// Compile the system default keymap and serialize it for upload.
    pub(crate) fn compile() -> Result<Self, KeymapError> {
        let context = xkb::Context::new(xkb::CONTEXT_NO_FLAGS);
        let keymap = xkb::Keymap::new_from_names(
            &context,
            "",
            "",
            "",
            "",
            None,
            xkb::KEYMAP_COMPILE_NO_FLAGS,
        )
        .ok_or(KeymapError::Compile)?;

        let text = keymap.get_as_string(xkb::KEYMAP_FORMAT_TEXT_V1);
        let mut file = tempfile::tempfile()?;
        file.write_all(text.as_bytes())?;
        file.write_all(&[0])?;
        let size = u32::try_from(text.len() + 1).map_err(|_| KeymapError::Compile)?;

        Ok(Self {
            state: xkb::State::new(&keymap),
            modifiers: Modifiers::default(),
            file,
            size,
        })
    }

    pub(crate) fn fd(&self) -> impl AsFd + '_ {
        self.file.as_fd()
    }

    pub(crate) fn size(&self) -> u32 {
        self.size
    }

    /// Track a replayed key. Returns the new modifier quadruple when the
    /// serialized state changed, which must then be announced on the
    /// virtual keyboard.
    pub(crate) fn update_key(&mut self, key: u32, state: KeyState) -> Option<Modifiers> {
        let direction = match state {
            KeyState::Pressed => xkb::KeyDirection::Down,
            KeyState::Released => xkb::KeyDirection::Up,
        };
        self.state
            .update_key(xkb::Keycode::new(key + EVDEV_OFFSET), direction);

        let modifiers = Modifiers {
            depressed: self.state.serialize_mods(xkb::STATE_MODS_DEPRESSED),
            latched: self.state.serialize_mods(xkb::STATE_MODS_LATCHED),
            locked: self.state.serialize_mods(xkb::STATE_MODS_LOCKED),
            group: self.state.serialize_layout(xkb::STATE_LAYOUT_EFFECTIVE),
        };
        if modifiers != self.modifiers {
            self.modifiers = modifiers;
            Some(modifiers)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // KEY_LEFTSHIFT / KEY_A from <linux/input-event-codes.h>
    const KEY_LEFTSHIFT: u32 = 42;
    const KEY_A: u32 = 30;

    #[test]
    fn shift_toggles_depressed_mods() {
        let mut keymap = Keymap::compile().unwrap();
        let mods = keymap.update_key(KEY_LEFTSHIFT, KeyState::Pressed).unwrap();
        assert_ne!(mods.depressed, 0);
        let mods = keymap.update_key(KEY_LEFTSHIFT, KeyState::Released).unwrap();
        assert_eq!(mods.depressed, 0);
    }

    #[test]
    fn plain_keys_leave_modifiers_alone() {
        let mut keymap = Keymap::compile().unwrap();
        assert_eq!(keymap.update_key(KEY_A, KeyState::Pressed), None);
        assert_eq!(keymap.update_key(KEY_A, KeyState::Released), None);
    }

    #[test]
    fn serialized_keymap_is_nul_terminated() {
        let keymap = Keymap::compile().unwrap();
        assert!(keymap.size() > 1);
    }
}

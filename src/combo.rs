//! The escape combo: the only sanctioned way out of the daemon.
//!
//! A combo is a sequence of slots, each a set of alias key codes. A slot is
//! active while any of its aliases is physically held; the combo fires on
//! the key press that makes every slot active at once.

use input_event::KeyState;

#[derive(Debug, Clone)]
struct Slot {
    aliases: Vec<u32>,
    /// per-alias held state, parallel to `aliases`
    held: Vec<bool>,
}

impl Slot {
    fn new(aliases: Vec<u32>) -> Self {
        let held = vec![false; aliases.len()];
        Self { aliases, held }
    }

    fn active(&self) -> bool {
        self.held.iter().any(|h| *h)
    }
}

#[derive(Debug, Clone)]
pub struct EscapeCombo {
    slots: Vec<Slot>,
}

impl EscapeCombo {
    pub fn new(slots: Vec<Vec<u32>>) -> Self {
        Self {
            slots: slots.into_iter().map(Slot::new).collect(),
        }
    }

    /// Track a key event against the live keyboard state. Returns true when
    /// this press completed the chord.
    pub fn update(&mut self, key: u32, state: KeyState) -> bool {
        let mut matched = false;
        for slot in &mut self.slots {
            for (alias, held) in slot.aliases.iter().zip(slot.held.iter_mut()) {
                if *alias == key {
                    *held = state.is_pressed();
                    matched = true;
                }
            }
        }
        matched && state.is_pressed() && self.slots.iter().all(Slot::active)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_ESC: u32 = 1;
    const KEY_LEFTSHIFT: u32 = 42;
    const KEY_RIGHTSHIFT: u32 = 54;

    fn default_combo() -> EscapeCombo {
        EscapeCombo::new(vec![
            vec![KEY_LEFTSHIFT],
            vec![KEY_RIGHTSHIFT],
            vec![KEY_ESC],
        ])
    }

    #[test]
    fn fires_on_the_completing_press() {
        let mut combo = default_combo();
        assert!(!combo.update(KEY_LEFTSHIFT, KeyState::Pressed));
        assert!(!combo.update(KEY_RIGHTSHIFT, KeyState::Pressed));
        assert!(combo.update(KEY_ESC, KeyState::Pressed));
    }

    #[test]
    fn releasing_a_slot_resets_it() {
        let mut combo = default_combo();
        combo.update(KEY_LEFTSHIFT, KeyState::Pressed);
        combo.update(KEY_RIGHTSHIFT, KeyState::Pressed);
        combo.update(KEY_LEFTSHIFT, KeyState::Released);
        assert!(!combo.update(KEY_ESC, KeyState::Pressed));
    }

    #[test]
    fn a_single_slot_alone_never_fires() {
        let mut combo = default_combo();
        assert!(!combo.update(KEY_ESC, KeyState::Pressed));
    }

    #[test]
    fn any_alias_keeps_a_slot_active() {
        let mut combo = EscapeCombo::new(vec![
            vec![KEY_LEFTSHIFT, KEY_RIGHTSHIFT],
            vec![KEY_ESC],
        ]);
        combo.update(KEY_LEFTSHIFT, KeyState::Pressed);
        combo.update(KEY_RIGHTSHIFT, KeyState::Pressed);
        // one alias released, the other still holds the slot
        combo.update(KEY_LEFTSHIFT, KeyState::Released);
        assert!(combo.update(KEY_ESC, KeyState::Pressed));
    }

    #[test]
    fn unrelated_keys_are_ignored() {
        let mut combo = default_combo();
        combo.update(KEY_LEFTSHIFT, KeyState::Pressed);
        combo.update(KEY_RIGHTSHIFT, KeyState::Pressed);
        assert!(!combo.update(30, KeyState::Pressed));
        assert!(combo.update(KEY_ESC, KeyState::Pressed));
    }

    #[test]
    fn releases_never_fire_even_when_all_slots_are_active() {
        let mut combo = EscapeCombo::new(vec![vec![KEY_LEFTSHIFT, KEY_RIGHTSHIFT]]);
        combo.update(KEY_LEFTSHIFT, KeyState::Pressed);
        combo.update(KEY_RIGHTSHIFT, KeyState::Pressed);
        assert!(!combo.update(KEY_LEFTSHIFT, KeyState::Released));
    }
}

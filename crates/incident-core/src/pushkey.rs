use rand::Rng;
use std::sync::Mutex;

/// Key alphabet, in ASCII order so keys sort by creation time.
const PUSH_CHARS: &[u8; 64] = b"-0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ_abcdefghijklmnopqrstuvwxyz";
const TIME_CHARS: usize = 8;
const RANDOM_CHARS: usize = 12;

pub const PUSH_KEY_LEN: usize = TIME_CHARS + RANDOM_CHARS;

/// Generates 20-character, chronologically ordered unique keys.
///
/// The first 8 characters encode the millisecond timestamp, the last 12 are
/// random. Two keys generated in the same millisecond share the random part
/// incremented by one, so keys from one generator are strictly increasing.
#[derive(Debug, Default)]
pub struct PushKeyGenerator {
    state: Mutex<GeneratorState>,
}

#[derive(Debug, Default)]
struct GeneratorState {
    last_ms: i64,
    last_random: [u8; RANDOM_CHARS],
}

impl PushKeyGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_key(&self) -> String {
        self.next_key_at(crate::types::now_millis())
    }

    /// Generate a key as if the clock read `now_ms`. A clock that moves
    /// backwards is treated as standing still.
    pub fn next_key_at(&self, now_ms: i64) -> String {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let now = now_ms.max(state.last_ms);
        if now == state.last_ms && state.last_ms != 0 {
            increment(&mut state.last_random);
        } else {
            let mut rng = rand::thread_rng();
            for slot in state.last_random.iter_mut() {
                *slot = rng.gen_range(0..64);
            }
        }
        state.last_ms = now;

        let mut key = Vec::with_capacity(PUSH_KEY_LEN);
        let mut remaining = now.max(0) as u64;
        let mut time_part = [0u8; TIME_CHARS];
        for slot in time_part.iter_mut().rev() {
            *slot = PUSH_CHARS[(remaining % 64) as usize];
            remaining /= 64;
        }
        key.extend_from_slice(&time_part);
        key.extend(state.last_random.iter().map(|&i| PUSH_CHARS[i as usize]));

        String::from_utf8(key).unwrap_or_default()
    }
}

// Carry into the next digit on overflow, like adding one to a base-64 number.
fn increment(digits: &mut [u8; RANDOM_CHARS]) {
    for digit in digits.iter_mut().rev() {
        if *digit == 63 {
            *digit = 0;
        } else {
            *digit += 1;
            return;
        }
    }
}

/// Recover the millisecond timestamp encoded in a push key.
pub fn key_timestamp(key: &str) -> Option<i64> {
    if key.len() != PUSH_KEY_LEN {
        return None;
    }
    let mut ms: i64 = 0;
    for b in key.bytes().take(TIME_CHARS) {
        let digit = PUSH_CHARS.iter().position(|&c| c == b)?;
        ms = ms * 64 + digit as i64;
    }
    Some(ms)
}

//
// Copyright 2026 Hans W. Uhlig. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! A process-wide free-list of [`Message`] values.
//!
//! Messages own three potentially large buffers (payload, body scratch,
//! metadata), so the read and dispatch paths recycle them instead of
//! reallocating per frame. [`put`] resets the message before it re-enters
//! the pool; reuse without reset is a defect, and a message must not be
//! touched after it has been returned.

use super::Message;
use parking_lot::Mutex;

/// Upper bound on pooled messages; beyond this they are simply dropped.
const MAX_POOLED: usize = 128;

static POOL: Mutex<Vec<Message>> = Mutex::new(Vec::new());

/// Takes a pristine message from the pool, allocating if it is empty.
#[must_use]
pub fn get() -> Message {
    POOL.lock().pop().unwrap_or_default()
}

/// Resets `msg` and returns it to the pool.
pub fn put(mut msg: Message) {
    msg.reset();
    let mut pool = POOL.lock();
    if pool.len() < MAX_POOLED {
        pool.push(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_returns_valid_message() {
        let msg = get();
        assert!(msg.header.check_magic());
        put(msg);
    }

    #[test]
    fn test_put_resets_before_pooling() {
        let mut msg = get();
        msg.payload.extend_from_slice(b"leftover");
        msg.metadata.insert("k".to_string(), "v".to_string());
        put(msg);

        // Nothing in the pool may carry stale state.
        let pool = POOL.lock();
        for msg in pool.iter() {
            assert!(msg.payload.is_empty());
            assert!(msg.metadata.is_empty());
        }
    }
}

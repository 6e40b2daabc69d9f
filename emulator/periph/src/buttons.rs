// Licensed under the Apache-2.0 license

//! Scripted front-panel button events for driving the installer's
//! confirmation step in tests and unattended runs.

use boot1_hil::{Decision, UserInput};
use std::collections::VecDeque;

pub struct ButtonScript {
    events: VecDeque<Decision>,
}

impl ButtonScript {
    pub fn new(events: impl IntoIterator<Item = Decision>) -> Self {
        ButtonScript {
            events: events.into_iter().collect(),
        }
    }
}

impl UserInput for ButtonScript {
    fn wait_decision(&mut self) -> Decision {
        // A drained script means the operator walked away; treat it as a
        // cancellation rather than blocking forever.
        self.events.pop_front().unwrap_or(Decision::Cancel)
    }
}

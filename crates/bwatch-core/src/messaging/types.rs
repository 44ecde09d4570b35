/// Result of a single outbound call.
///
/// A recipient that blocked the bot (or vanished) is an expected outcome, not an
/// error, so it gets its own variant instead of travelling through `Result`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered,
    RecipientUnavailable,
    TransientFailure(String),
}

impl SendOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendOutcome::Delivered)
    }
}

/// Keyboard attached to an outgoing message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Keyboard {
    /// Buttons under the message that emit callback queries.
    Inline(Vec<Vec<InlineButton>>),
    /// Persistent reply keyboard replacing the user's input keyboard.
    Reply(Vec<Vec<String>>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineButton {
    pub label: String,
    pub callback_data: String,
}

impl InlineButton {
    pub fn new(label: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            callback_data: callback_data.into(),
        }
    }
}

impl Keyboard {
    pub fn single(label: impl Into<String>, callback_data: impl Into<String>) -> Self {
        Keyboard::Inline(vec![vec![InlineButton::new(label, callback_data)]])
    }
}

/// Stars invoice for one subscription plan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invoice {
    pub title: String,
    pub description: String,
    pub payload: String,
    pub currency: String,
    pub label: String,
    pub amount: u32,
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator interaction.
//!
//! Configuration prompts and restart confirmations go through [`Prompt`] so
//! the library never touches the terminal directly.

use std::collections::VecDeque;
use std::io::{BufRead, Write};
use std::sync::Mutex;

/// Asks the operator for values and confirmations.
pub trait Prompt: Send + Sync {
    /// Ask for a value. `None` when no answer is available.
    fn ask(&self, message: &str) -> Option<String>;

    /// Ask a yes/no question.
    fn confirm(&self, message: &str) -> bool;
}

/// Prompts on stderr and reads answers from stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPrompt;

impl StdinPrompt {
    fn read_line(message: &str) -> Option<String> {
        let mut stderr = std::io::stderr().lock();
        write!(stderr, "{message}: ").ok()?;
        stderr.flush().ok()?;
        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line) {
            Ok(0) | Err(_) => None,
            Ok(_) => Some(line.trim().to_string()),
        }
    }
}

impl Prompt for StdinPrompt {
    fn ask(&self, message: &str) -> Option<String> {
        Self::read_line(message).filter(|answer| !answer.is_empty())
    }

    fn confirm(&self, message: &str) -> bool {
        Self::read_line(&format!("{message} y/n"))
            .is_some_and(|answer| answer.eq_ignore_ascii_case("y"))
    }
}

/// Never answers and declines every confirmation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPrompt;

impl Prompt for NoPrompt {
    fn ask(&self, _message: &str) -> Option<String> {
        None
    }

    fn confirm(&self, _message: &str) -> bool {
        false
    }
}

/// Replays prepared answers and records every question asked.
#[derive(Debug, Default)]
pub struct ScriptedPrompt {
    answers: Mutex<VecDeque<String>>,
    confirmations: Mutex<VecDeque<bool>>,
    asked: Mutex<Vec<String>>,
}

impl ScriptedPrompt {
    /// Create a prompt with no prepared answers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an answer for [`Prompt::ask`].
    pub fn with_answer(self, answer: impl Into<String>) -> Self {
        if let Ok(mut answers) = self.answers.lock() {
            answers.push_back(answer.into());
        }
        self
    }

    /// Queue an answer for [`Prompt::confirm`].
    pub fn with_confirmation(self, yes: bool) -> Self {
        if let Ok(mut confirmations) = self.confirmations.lock() {
            confirmations.push_back(yes);
        }
        self
    }

    /// Questions asked so far, in order.
    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().map(|a| a.clone()).unwrap_or_default()
    }

    fn record(&self, message: &str) {
        if let Ok(mut asked) = self.asked.lock() {
            asked.push(message.to_string());
        }
    }
}

impl Prompt for ScriptedPrompt {
    fn ask(&self, message: &str) -> Option<String> {
        self.record(message);
        self.answers.lock().ok()?.pop_front()
    }

    fn confirm(&self, message: &str) -> bool {
        self.record(message);
        self.confirmations
            .lock()
            .ok()
            .and_then(|mut c| c.pop_front())
            .unwrap_or(false)
    }
}

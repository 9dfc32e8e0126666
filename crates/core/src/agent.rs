//! Per-patient conversational agent.
//!
//! A [`PatientAgent`] holds the record snapshot and the conversation history
//! for one patient. Every session of that patient shares the same agent, so
//! the history sits behind an async mutex that a caller holds for a whole
//! turn through a [`Turn`] guard.

use crate::{
    llm_client::ChatMessage,
    records::{PatientContext, PatientRecords},
};
use tokio::sync::{Mutex, MutexGuard};

pub const DEFAULT_CHAT_PROMPT: &str = "You are MedForce, a clinical assistant for a hepatology care team. \
Answer questions about the current patient using the patient context and the available tools. \
Call a tool whenever the answer depends on records you have not seen yet. \
Be concise, cite the record a fact comes from, and say so plainly when the records do not contain an answer.";

pub struct PatientAgent {
    patient_id: String,
    system_prompt: String,
    context: PatientContext,
    history: Mutex<Vec<ChatMessage>>,
}

impl PatientAgent {
    pub fn new(patient_id: impl Into<String>, system_prompt: impl Into<String>, context: PatientContext) -> Self {
        Self {
            patient_id: patient_id.into(),
            system_prompt: system_prompt.into(),
            context,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Creates an agent with the patient's records loaded.
    pub async fn load(patient_id: &str, system_prompt: &str, records: &PatientRecords) -> Self {
        let context = records.load_context(patient_id).await;
        Self::new(patient_id, system_prompt, context)
    }

    pub fn patient_id(&self) -> &str {
        &self.patient_id
    }

    pub fn context(&self) -> &PatientContext {
        &self.context
    }

    /// Waits for any other turn on this agent to finish, then starts one.
    pub async fn begin_turn(&self) -> Turn<'_> {
        Turn {
            agent: self,
            history: self.history.lock().await,
        }
    }

    pub async fn history(&self) -> Vec<ChatMessage> {
        self.history.lock().await.clone()
    }
}

/// Exclusive access to an agent's history for the duration of one turn.
pub struct Turn<'a> {
    agent: &'a PatientAgent,
    history: MutexGuard<'a, Vec<ChatMessage>>,
}

impl Turn<'_> {
    /// Builds the model input: system prompt, prior history, then the user
    /// message with the patient context prepended.
    pub fn messages_for(&self, user_message: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.history.len() + 2);
        messages.push(ChatMessage::System(self.agent.system_prompt.clone()));
        messages.extend(self.history.iter().cloned());
        let context = self.agent.context.to_prompt();
        let user = if context.is_empty() {
            user_message.to_string()
        } else {
            format!("{}\n\nUser Question: {}", context, user_message)
        };
        messages.push(ChatMessage::User(user));
        messages
    }

    /// Records a completed exchange. Only the plain user text is stored so
    /// the context block is not repeated in every historical turn.
    pub fn record(&mut self, user_message: &str, reply: &str) {
        self.history.push(ChatMessage::User(user_message.to_string()));
        self.history.push(ChatMessage::assistant_text(reply));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::{sync::Arc, time::Duration};

    fn context_with_profile() -> PatientContext {
        let mut context = PatientContext::empty("P0001");
        context
            .data
            .insert("patient_profile".into(), Some(json!("Known PBC")));
        context
    }

    #[tokio::test]
    async fn test_messages_include_context_and_history() {
        let agent = PatientAgent::new("P0001", "system", context_with_profile());
        {
            let mut turn = agent.begin_turn().await;
            turn.record("first question", "first answer");
        }

        let turn = agent.begin_turn().await;
        let messages = turn.messages_for("second question");
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], ChatMessage::System("system".into()));
        assert_eq!(messages[1], ChatMessage::User("first question".into()));
        match &messages[3] {
            ChatMessage::User(text) => {
                assert!(text.contains("Known PBC"));
                assert!(text.ends_with("User Question: second question"));
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_empty_context_sends_plain_question() {
        let agent = PatientAgent::new("P0009", "system", PatientContext::empty("P0009"));
        let turn = agent.begin_turn().await;
        assert_eq!(
            turn.messages_for("hello").last(),
            Some(&ChatMessage::User("hello".into()))
        );
    }

    #[tokio::test]
    async fn test_turns_are_serialised() {
        let agent = Arc::new(PatientAgent::new("P0001", "s", PatientContext::empty("P0001")));
        let first = agent.begin_turn().await;

        let other = agent.clone();
        let waiter = tokio::spawn(async move {
            let mut turn = other.begin_turn().await;
            turn.record("q2", "a2");
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(first);
        waiter.await.unwrap();
        assert_eq!(agent.history().await.len(), 2);
    }
}

//! Child profile: the context every answer is grounded in.

use crate::CHILD_PROFILE_KEY;
use ndis_storage::{KeyValueStore, KeyValueStoreExt, StorageError};
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

const PROMPT_INTRO: &str = "You are a helpful assistant for parents navigating their child's NDIS plan and functional assessment. ";

const PROMPT_OUTRO: &str = "Please provide helpful, accurate, and personalized advice based on this specific child's assessment and NDIS plan. If asked about something not covered in the provided information, clearly state that you don't have that specific information and suggest consulting with the child's support team or NDIS coordinator.";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ChildProfile {
    pub name: String,
    pub age: u32,
    pub gender: String,
    pub general_background: String,
    pub functional_assessment: String,
    pub ndis_plan: String,
    pub other_information: String,
}

impl ChildProfile {
    /// Required fields that are still empty.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.name.trim().is_empty() {
            missing.push("name");
        }
        if self.age == 0 {
            missing.push("age");
        }
        if self.gender.trim().is_empty() {
            missing.push("gender");
        }
        if self.functional_assessment.trim().is_empty() {
            missing.push("functional assessment");
        }
        if self.ndis_plan.trim().is_empty() {
            missing.push("NDIS plan");
        }
        missing
    }

    pub fn is_complete(&self) -> bool {
        self.missing_fields().is_empty()
    }

    /// System message embedding the profile. Optional sections appear only
    /// when they have content.
    pub fn system_prompt(&self) -> String {
        let mut prompt = String::with_capacity(1024);
        let _ = write!(
            prompt,
            "{PROMPT_INTRO}\n\nChild Information:\n- Name: {}\n- Age: {}\n- Gender: {}\n\n",
            self.name, self.age, self.gender
        );

        let sections = [
            ("General Background", &self.general_background),
            ("Functional Assessment", &self.functional_assessment),
            ("NDIS Plan", &self.ndis_plan),
            ("Other Information", &self.other_information),
        ];
        for (title, body) in sections {
            if !body.is_empty() {
                let _ = write!(prompt, "{title}:\n{body}\n\n");
            }
        }

        prompt.push_str(PROMPT_OUTRO);
        prompt
    }

    pub fn apply(&mut self, update: ProfileUpdate) {
        let ProfileUpdate {
            name,
            age,
            gender,
            general_background,
            functional_assessment,
            ndis_plan,
            other_information,
        } = update;
        if let Some(v) = name {
            self.name = v;
        }
        if let Some(v) = age {
            self.age = v;
        }
        if let Some(v) = gender {
            self.gender = v;
        }
        if let Some(v) = general_background {
            self.general_background = v;
        }
        if let Some(v) = functional_assessment {
            self.functional_assessment = v;
        }
        if let Some(v) = ndis_plan {
            self.ndis_plan = v;
        }
        if let Some(v) = other_information {
            self.other_information = v;
        }
    }
}

/// Partial profile edit; `None` fields are left as they are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProfileUpdate {
    pub name: Option<String>,
    pub age: Option<u32>,
    pub gender: Option<String>,
    pub general_background: Option<String>,
    pub functional_assessment: Option<String>,
    pub ndis_plan: Option<String>,
    pub other_information: Option<String>,
}

/// Keeps the current profile in memory and writes every change through.
pub struct ProfileService {
    store: Arc<dyn KeyValueStore>,
    profile: Mutex<ChildProfile>,
}

impl ProfileService {
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let profile = store.load(CHILD_PROFILE_KEY, ChildProfile::default());
        Self {
            store,
            profile: Mutex::new(profile),
        }
    }

    pub fn profile(&self) -> ChildProfile {
        self.lock().clone()
    }

    pub fn has_profile(&self) -> bool {
        self.lock().is_complete()
    }

    /// Merge `update` into the profile and persist the result.
    pub fn update(&self, update: ProfileUpdate) -> Result<ChildProfile, StorageError> {
        let mut profile = self.lock();
        let mut next = profile.clone();
        next.apply(update);
        self.store.save(CHILD_PROFILE_KEY, &next)?;
        *profile = next.clone();
        Ok(next)
    }

    pub fn replace(&self, profile: ChildProfile) -> Result<(), StorageError> {
        let mut current = self.lock();
        self.store.save(CHILD_PROFILE_KEY, &profile)?;
        *current = profile;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ChildProfile> {
        self.profile.lock().expect("profile mutex poisoned")
    }
}

//! Contribution events returned by `GET /users/:id/events`.

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Event {
    pub id: u64,
    #[serde(default)]
    pub project_id: Option<u64>,
    #[serde(default)]
    pub action_name: Option<String>,
    #[serde(default)]
    pub target_type: Option<String>,
    #[serde(default)]
    pub target_title: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub push_data: Option<PushData>,
    #[serde(default)]
    pub note: Option<EventNote>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PushData {
    #[serde(default)]
    pub commit_count: u64,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub ref_type: Option<String>,
    #[serde(default)]
    pub commit_to: Option<String>,
    #[serde(default, rename = "ref")]
    pub ref_name: Option<String>,
    #[serde(default)]
    pub commit_title: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EventNote {
    pub id: u64,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub noteable_type: Option<String>,
    #[serde(default)]
    pub noteable_iid: Option<u64>,
}

impl Event {
    /// Head commit of a push event, if the push carried commits.
    pub fn pushed_commit(&self) -> Option<(&str, &PushData)> {
        let data = self.push_data.as_ref()?;
        if data.commit_count == 0 {
            return None;
        }
        data.commit_to.as_deref().map(|sha| (sha, data))
    }
}

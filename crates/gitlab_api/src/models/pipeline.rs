use serde::Deserialize;

pub const PIPELINE_RUNNING: &str = "running";
pub const PIPELINE_SUCCESS: &str = "success";

#[derive(Debug, Deserialize, Clone)]
pub struct Pipeline {
    pub id: u64,
    #[serde(default)]
    pub iid: Option<u64>,
    pub project_id: u64,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default, rename = "ref")]
    pub ref_name: Option<String>,
    pub status: String,
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default)]
    pub created_at: Option<String>,
}

impl Pipeline {
    pub fn is_running(&self) -> bool {
        self.status == PIPELINE_RUNNING
    }
}

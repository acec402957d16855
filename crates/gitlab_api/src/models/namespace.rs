use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Namespace {
    pub id: u64,
    pub path: String,
    #[serde(default)]
    pub kind: Option<String>,
    /// Only reported by instances with licensed plans (e.g. gitlab.com).
    #[serde(default)]
    pub plan: Option<String>,
}

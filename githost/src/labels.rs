use std::collections::HashMap;

/// Docker labels marking images and containers managed by githost
#[derive(Debug, Clone)]
pub struct DeployLabels {
    prefix: String,
}

impl DeployLabels {
    pub fn new(prefix: impl Into<String>) -> Self {
        DeployLabels {
            prefix: prefix.into(),
        }
    }

    pub fn enabled_key(&self) -> String {
        format!("{}.enabled", self.prefix)
    }

    pub fn repo_key(&self) -> String {
        format!("{}.repo", self.prefix)
    }

    pub fn commit_key(&self) -> String {
        format!("{}.commit", self.prefix)
    }

    /// Labels selecting every deployed container of `repo`
    pub fn selector(&self, repo: &str) -> HashMap<String, String> {
        HashMap::from([
            (self.enabled_key(), "true".to_string()),
            (self.repo_key(), repo.to_string()),
        ])
    }

    /// Full label set for an image or container built from `commit`
    pub fn for_commit(&self, repo: &str, commit: &str) -> HashMap<String, String> {
        let mut labels = self.selector(repo);
        labels.insert(self.commit_key(), commit.to_string());
        labels
    }
}

impl Default for DeployLabels {
    fn default() -> Self {
        DeployLabels::new("githost")
    }
}

//! Bus subject builders.
//!
//! Subjects are assembled here so the naming scheme lives in one place.

use crate::types::{IdentityId, WorkspaceId};

/// Request subject for the connect handshake.
pub fn runtime_connect() -> String {
    "runtime.connect".to_string()
}

/// Publish subject the control plane uses to force a runtime to re-auth.
pub fn runtime_reconnect(runtime: &IdentityId) -> String {
    format!("runtime.{}.reconnect", runtime)
}

/// Request subject for relaying a tool call to the runtime that owns the
/// worker.
pub fn runtime_call(runtime: &IdentityId) -> String {
    format!("runtime.{}.call", runtime)
}

/// Publish subject carrying declarative tool configuration for a workspace.
pub fn workspace_tools_config(workspace: &WorkspaceId) -> String {
    format!("workspace.{}.tools-config", workspace)
}

/// Publish subject carrying the tool configuration projected for one skill.
pub fn skill_tools_config(skill: &IdentityId) -> String {
    format!("skill.{}.tools-config", skill)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_shapes() {
        let rid = IdentityId::new("rt-1");
        let wsid = WorkspaceId::new("ws-1");
        assert_eq!(runtime_connect(), "runtime.connect");
        assert_eq!(runtime_reconnect(&rid), "runtime.rt-1.reconnect");
        assert_eq!(runtime_call(&rid), "runtime.rt-1.call");
        assert_eq!(workspace_tools_config(&wsid), "workspace.ws-1.tools-config");
        assert_eq!(
            skill_tools_config(&IdentityId::new("sk-9")),
            "skill.sk-9.tools-config"
        );
    }
}

//! Game commands issued over the control channel.

use serde_json::json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameCommand {
    /// Re-enable autosave
    SaveOn,
    /// Disable autosave while a snapshot is copied
    SaveOff,
    /// Write in-memory state to disk; `flush` waits for the writes to finish
    SaveAll { flush: bool },
    /// Message shown to every player
    Broadcast(String),
}

impl GameCommand {
    pub fn render(&self) -> String {
        match self {
            GameCommand::SaveOn => "save-on".to_string(),
            GameCommand::SaveOff => "save-off".to_string(),
            GameCommand::SaveAll { flush: true } => "save-all flush".to_string(),
            GameCommand::SaveAll { flush: false } => "save-all".to_string(),
            GameCommand::Broadcast(msg) => {
                let component = json!({ "text": msg, "color": "light_purple" });
                format!("tellraw @a {}", component)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_save_commands() {
        assert_eq!(GameCommand::SaveOff.render(), "save-off");
        assert_eq!(GameCommand::SaveAll { flush: true }.render(), "save-all flush");
        assert_eq!(GameCommand::SaveAll { flush: false }.render(), "save-all");
    }

    #[test]
    fn test_broadcast_escapes_text() {
        let rendered = GameCommand::Broadcast(r#"Backup "done""#.into()).render();
        assert!(rendered.starts_with("tellraw @a {"));
        let component: serde_json::Value =
            serde_json::from_str(rendered.trim_start_matches("tellraw @a ")).unwrap();
        assert_eq!(component["text"], r#"Backup "done""#);
        assert_eq!(component["color"], "light_purple");
    }
}

use serde::{Deserialize, Serialize};

/// Command envelope carried on the `bots:commands` pub/sub channel.
///
/// Producers (the admin console and the game server) publish camelCase JSON
/// with a `type` discriminator. Extra payload fields on the player events
/// are ignored; envelopes with an unrecognized `type` fail to decode and the
/// subscriber logs and discards them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FleetCommand {
    /// Initialize the rotation queue and resume deployments.
    #[serde(rename = "deploy")]
    Deploy,

    /// Stop specific bots, or the whole fleet when `botIds` is absent.
    #[serde(rename = "stop")]
    Stop {
        #[serde(rename = "botIds", default)]
        bot_ids: Option<Vec<String>>,
    },

    /// Published by the game server once it has removed the bot from the
    /// active set. Returns the bot to the rotation.
    #[serde(rename = "botMatchComplete")]
    BotMatchComplete {
        #[serde(rename = "botId")]
        bot_id: String,
    },

    /// Persist a new fleet-size cap and reconcile.
    #[serde(rename = "rotateConfig")]
    RotateConfig {
        #[serde(rename = "maxDeployed")]
        max_deployed: i64,
    },

    /// A human entered the queue. No immediate action; the reconciler
    /// reacts within its tick interval.
    #[serde(rename = "playerQueued")]
    PlayerQueued,

    /// A human left the queue.
    #[serde(rename = "playerDequeued")]
    PlayerDequeued,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_deploy() {
        let cmd: FleetCommand = serde_json::from_str(r#"{"type":"deploy"}"#).unwrap();
        assert!(matches!(cmd, FleetCommand::Deploy));
    }

    #[test]
    fn decodes_stop_with_and_without_ids() {
        let cmd: FleetCommand =
            serde_json::from_str(r#"{"type":"stop","botIds":["a","b"]}"#).unwrap();
        match cmd {
            FleetCommand::Stop { bot_ids } => assert_eq!(bot_ids.unwrap(), vec!["a", "b"]),
            other => panic!("unexpected command: {other:?}"),
        }

        let cmd: FleetCommand = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert!(matches!(cmd, FleetCommand::Stop { bot_ids: None }));
    }

    #[test]
    fn decodes_match_complete() {
        let cmd: FleetCommand =
            serde_json::from_str(r#"{"type":"botMatchComplete","botId":"bot-7"}"#).unwrap();
        match cmd {
            FleetCommand::BotMatchComplete { bot_id } => assert_eq!(bot_id, "bot-7"),
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn player_events_ignore_extra_payload() {
        let cmd: FleetCommand =
            serde_json::from_str(r#"{"type":"playerQueued","userId":"u1","rating":1200}"#).unwrap();
        assert!(matches!(cmd, FleetCommand::PlayerQueued));
    }

    #[test]
    fn unknown_type_fails_to_decode() {
        let parsed = serde_json::from_str::<FleetCommand>(r#"{"type":"selfDestruct"}"#);
        assert!(parsed.is_err());
    }
}

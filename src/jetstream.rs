use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::MAX_WANTED_DIDS;

pub const COLLECTION_PROFILE: &str = "app.bsky.actor.profile";
pub const COLLECTION_FOLLOW: &str = "app.bsky.graph.follow";

#[derive(Debug, Deserialize, PartialEq)]
pub struct JetstreamCommitMessage {
    pub did: String,
    pub time_us: i64,
    pub kind: String,
    pub commit: JetstreamCommit,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct JetstreamCommit {
    pub operation: String,
    pub collection: String,
    pub rkey: String,
    pub record: Option<Lexicon>,
    pub cid: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct JetstreamIdentityMessage {
    pub did: String,
    pub time_us: i64,
    pub kind: String,
    pub identity: JetstreamIdentity,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct JetstreamIdentity {
    pub did: String,
    pub handle: Option<String>,
    pub seq: i64,
    pub time: DateTime<Utc>,
}

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "$type")]
pub enum Lexicon {
    #[serde(rename = "app.bsky.actor.profile")]
    AppBskyActorProfile(ProfileRecord),
    #[serde(rename = "app.bsky.graph.follow")]
    AppBskyGraphFollow(FollowRecord),
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct ProfileRecord {
    #[serde(rename = "displayName")]
    pub display_name: Option<String>,
    pub avatar: Option<AvatarBlob>,
}

impl ProfileRecord {
    /// The avatar's content ref, when the record carries one.
    pub fn avatar_ref(&self) -> Option<&str> {
        self.avatar
            .as_ref()
            .and_then(|blob| blob.r#ref.as_ref())
            .map(|link| link.link.as_str())
    }
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct AvatarBlob {
    pub r#ref: Option<CidLink>,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct CidLink {
    #[serde(rename = "$link")]
    pub link: String,
}

#[derive(Debug, Deserialize, PartialEq)]
pub struct FollowRecord {
    pub subject: String,
    #[serde(rename = "createdAt")]
    pub created_at: Option<String>,
}

#[derive(Debug)]
pub enum JetstreamMessage {
    Commit(JetstreamCommitMessage),
    Identity(JetstreamIdentityMessage),
}

impl JetstreamMessage {
    pub fn time_us(&self) -> i64 {
        match self {
            JetstreamMessage::Commit(message) => message.time_us,
            JetstreamMessage::Identity(message) => message.time_us,
        }
    }

    pub fn did(&self) -> &str {
        match self {
            JetstreamMessage::Commit(message) => &message.did,
            JetstreamMessage::Identity(message) => &message.did,
        }
    }
}

/// Decode one jetstream frame. Kinds this service does not care about
/// (account events etc.) come back as Ok(None).
pub fn read(data: &str) -> Result<Option<JetstreamMessage>> {
    let value: serde_json::Value = serde_json::from_str(data)?;
    let kind = value["kind"].as_str().unwrap_or_default();

    let message = match kind {
        "commit" => Some(JetstreamMessage::Commit(serde_json::from_value(value)?)),
        "identity" => Some(JetstreamMessage::Identity(serde_json::from_value(value)?)),
        _ => None,
    };

    Ok(message)
}

#[derive(Debug, Serialize)]
pub struct OptionsUpdate {
    #[serde(rename = "type")]
    pub type_: String,
    pub payload: OptionsPayload,
}

#[derive(Debug, Serialize)]
pub struct OptionsPayload {
    #[serde(rename = "wantedCollections")]
    pub wanted_collections: Vec<String>,
    #[serde(rename = "wantedDids")]
    pub wanted_dids: Vec<String>,
    #[serde(rename = "maxMessageSizeBytes")]
    pub max_message_size_bytes: u64,
}

/// Subscriber-sourced options frame, sent as the hello after connect and
/// re-sent to update filters. DIDs beyond the jetstream cap are dropped.
pub fn options_message(dids: &[String]) -> Result<String, serde_json::Error> {
    let wanted_dids = if dids.len() > MAX_WANTED_DIDS {
        tracing::warn!(
            "wanted DID list has {} entries, truncating to {}",
            dids.len(),
            MAX_WANTED_DIDS
        );
        dids[..MAX_WANTED_DIDS].to_vec()
    } else {
        dids.to_vec()
    };

    let update = OptionsUpdate {
        type_: "options_update".to_string(),
        payload: OptionsPayload {
            wanted_collections: vec![
                COLLECTION_PROFILE.to_string(),
                COLLECTION_FOLLOW.to_string(),
            ],
            wanted_dids,
            max_message_size_bytes: 0,
        },
    };

    serde_json::to_string(&update)
}

/// One upstream host, chosen uniformly at random per connection attempt.
pub fn pick_host(hosts: &[String]) -> &str {
    let n = rand::thread_rng().gen_range(0..hosts.len());
    &hosts[n]
}

/// requireHello makes the upstream wait for the options frame before
/// streaming anything.
pub fn subscribe_url(host: &str, cursor: Option<i64>) -> String {
    match cursor {
        Some(cursor) => format!("wss://{host}/subscribe?requireHello=true&cursor={cursor}"),
        None => format!("wss://{host}/subscribe?requireHello=true"),
    }
}

pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

/// The upstream's retention horizon.
pub fn micros_24h_ago() -> i64 {
    (Utc::now() - Duration::hours(24)).timestamp_micros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_identity() {
        let data = "{\"did\":\"did:plc:sh5zdynqtvfavtkv6estb73d\",\"time_us\":1731623029695659,\"kind\":\"identity\",\"identity\":{\"did\":\"did:plc:sh5zdynqtvfavtkv6estb73d\",\"handle\":\"irlasajj.bsky.social\",\"seq\":3478739942,\"time\":\"2024-11-14T22:23:49.147Z\"}}";
        let response = read(data).unwrap().unwrap();

        match response {
            JetstreamMessage::Identity(identity) => {
                assert_eq!(identity.did, "did:plc:sh5zdynqtvfavtkv6estb73d");
                assert_eq!(identity.time_us, 1731623029695659);
                assert_eq!(
                    identity.identity.handle,
                    Some("irlasajj.bsky.social".to_string())
                );
                assert_eq!(identity.identity.seq, 3478739942);
            }
            JetstreamMessage::Commit(_) => {
                panic!()
            }
        }
    }

    #[test]
    fn test_read_identity_without_handle() {
        let data = "{\"did\":\"did:plc:abc\",\"time_us\":1731623029695659,\"kind\":\"identity\",\"identity\":{\"did\":\"did:plc:abc\",\"seq\":1,\"time\":\"2024-11-14T22:23:49.147Z\"}}";
        let response = read(data).unwrap().unwrap();

        match response {
            JetstreamMessage::Identity(identity) => {
                assert_eq!(identity.identity.handle, None);
            }
            JetstreamMessage::Commit(_) => {
                panic!()
            }
        }
    }

    #[test]
    fn test_read_commit_create_profile() {
        let data = "{\"did\":\"did:plc:uhtptnlcrj4wrxfjfcanf34q\",\"time_us\":1731539977109649,\"kind\":\"commit\",\"commit\":{\"rev\":\"3lauicnwejh2f\",\"operation\":\"update\",\"collection\":\"app.bsky.actor.profile\",\"rkey\":\"self\",\"record\":{\"$type\":\"app.bsky.actor.profile\",\"displayName\":\"Alice\",\"avatar\":{\"$type\":\"blob\",\"ref\":{\"$link\":\"bafkreigw5ufnkavdzcczl2dusa3bcnkckhi4tscp6qsrsmg76s3ckseney\"},\"mimeType\":\"image/jpeg\",\"size\":12345}},\"cid\":\"bafyreifsdaip3s5nm3hcz4fbgkxodnils75oi3rmqhipwtom34rxw4vwdi\"}}";
        let response = read(data).unwrap().unwrap();

        match response {
            JetstreamMessage::Commit(commit) => {
                assert_eq!(commit.did, "did:plc:uhtptnlcrj4wrxfjfcanf34q");
                assert_eq!(commit.commit.operation, "update");
                assert_eq!(commit.commit.collection, COLLECTION_PROFILE);
                match commit.commit.record {
                    Some(Lexicon::AppBskyActorProfile(record)) => {
                        assert_eq!(record.display_name, Some("Alice".to_string()));
                        assert_eq!(
                            record.avatar_ref(),
                            Some("bafkreigw5ufnkavdzcczl2dusa3bcnkckhi4tscp6qsrsmg76s3ckseney")
                        );
                    }
                    other => panic!("unexpected record: {other:?}"),
                }
            }
            JetstreamMessage::Identity(_) => {
                panic!()
            }
        }
    }

    #[test]
    fn test_read_commit_create_follow() {
        let data = "{\"did\":\"did:plc:zfr76ms7mkg6ct7qldg5c3z5\",\"time_us\":1731623029598761,\"kind\":\"commit\",\"commit\":{\"rev\":\"3lawvnsupm222\",\"operation\":\"create\",\"collection\":\"app.bsky.graph.follow\",\"rkey\":\"3kwrdj3olqr2t\",\"record\":{\"$type\":\"app.bsky.graph.follow\",\"createdAt\":\"2024-11-14T22:23:49.092Z\",\"subject\":\"did:plc:pvvfw4tru5kvzrpra5dairkv\"},\"cid\":\"bafyreifsdaip3s5nm3hcz4fbgkxodnils75oi3rmqhipwtom34rxw4vwdi\"}}";
        let response = read(data).unwrap().unwrap();

        match response {
            JetstreamMessage::Commit(commit) => {
                assert_eq!(commit.commit.rkey, "3kwrdj3olqr2t");
                match commit.commit.record {
                    Some(Lexicon::AppBskyGraphFollow(record)) => {
                        assert_eq!(record.subject, "did:plc:pvvfw4tru5kvzrpra5dairkv");
                    }
                    other => panic!("unexpected record: {other:?}"),
                }
            }
            JetstreamMessage::Identity(_) => {
                panic!()
            }
        }
    }

    #[test]
    fn test_read_commit_delete_follow() {
        let data = "{\"did\":\"did:plc:zfr76ms7mkg6ct7qldg5c3z5\",\"time_us\":1731623029598761,\"kind\":\"commit\",\"commit\":{\"rev\":\"3lawvnsupm222\",\"operation\":\"delete\",\"collection\":\"app.bsky.graph.follow\",\"rkey\":\"3kwrdj3olqr2t\"}}";
        let response = read(data).unwrap().unwrap();

        match response {
            JetstreamMessage::Commit(commit) => {
                assert_eq!(commit.commit.operation, "delete");
                assert_eq!(commit.commit.record, None);
                assert_eq!(commit.commit.cid, None);
            }
            JetstreamMessage::Identity(_) => {
                panic!()
            }
        }
    }

    #[test]
    fn test_read_unknown_kind() {
        let data = "{\"did\":\"did:plc:pvvfw4tru5kvzrpra5dairkv\",\"time_us\":1731623029648609,\"kind\":\"account\",\"account\":{\"active\":true,\"did\":\"did:plc:pvvfw4tru5kvzrpra5dairkv\",\"seq\":3478739895,\"time\":\"2024-11-14T22:23:49.092Z\"}}";
        let response = read(data).unwrap();
        assert!(response.is_none());
    }

    #[test]
    fn test_read_malformed() {
        assert!(read("not json").is_err());
    }

    #[test]
    fn test_options_message_shape() {
        let dids = vec!["did:plc:a".to_string(), "did:plc:b".to_string()];
        let message = options_message(&dids).unwrap();
        let value: serde_json::Value = serde_json::from_str(&message).unwrap();

        assert_eq!(value["type"], "options_update");
        assert_eq!(
            value["payload"]["wantedCollections"],
            serde_json::json!([COLLECTION_PROFILE, COLLECTION_FOLLOW])
        );
        assert_eq!(
            value["payload"]["wantedDids"],
            serde_json::json!(["did:plc:a", "did:plc:b"])
        );
        assert_eq!(value["payload"]["maxMessageSizeBytes"], 0);
    }

    #[test]
    fn test_options_message_caps_dids() {
        let dids: Vec<String> = (0..MAX_WANTED_DIDS + 1)
            .map(|i| format!("did:plc:{i}"))
            .collect();
        let message = options_message(&dids).unwrap();
        let value: serde_json::Value = serde_json::from_str(&message).unwrap();

        let wanted = value["payload"]["wantedDids"].as_array().unwrap();
        assert_eq!(wanted.len(), MAX_WANTED_DIDS);
        assert_eq!(wanted[0], "did:plc:0");
        assert_eq!(wanted[MAX_WANTED_DIDS - 1], format!("did:plc:{}", MAX_WANTED_DIDS - 1));
    }

    #[test]
    fn test_options_message_at_cap() {
        let dids: Vec<String> = (0..MAX_WANTED_DIDS).map(|i| format!("did:plc:{i}")).collect();
        let message = options_message(&dids).unwrap();
        let value: serde_json::Value = serde_json::from_str(&message).unwrap();
        assert_eq!(
            value["payload"]["wantedDids"].as_array().unwrap().len(),
            MAX_WANTED_DIDS
        );
    }

    #[test]
    fn test_subscribe_url() {
        assert_eq!(
            subscribe_url("jetstream1.us-east.bsky.network", None),
            "wss://jetstream1.us-east.bsky.network/subscribe?requireHello=true"
        );
        assert_eq!(
            subscribe_url("jetstream1.us-east.bsky.network", Some(1731623029598761)),
            "wss://jetstream1.us-east.bsky.network/subscribe?requireHello=true&cursor=1731623029598761"
        );
    }

    #[test]
    fn test_pick_host_single() {
        let hosts = vec!["example.com".to_string()];
        assert_eq!(pick_host(&hosts), "example.com");
    }

    #[test]
    fn test_micros_24h_ago() {
        let now = now_micros();
        let then = micros_24h_ago();
        let day_us = 24 * 60 * 60 * 1_000_000i64;
        assert!(now - then >= day_us);
        assert!(now - then < day_us + 5_000_000);
    }
}

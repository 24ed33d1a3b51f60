use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{header, Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Errors surfaced by the stats API.
///
/// `SessionInvalid` is terminal for the affected user's push job; everything
/// else is transient and retried on the next tick without mutating state.
#[derive(Debug, Error)]
pub enum StatsError {
    #[error("session credential rejected by the stats API")]
    SessionInvalid,

    #[error("transient stats API failure: {message}")]
    Transient { message: String },
}

const DEFAULT_API_BASE: &str = "https://app.splatoon2.nintendo.net";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Upstream game-stats API surface the scheduler and sweeper poll against.
#[async_trait]
pub trait BattleFetcher: Send + Sync {
    /// Recent results plus the rolling last-50 summary.
    async fn fetch_overview(&self, credential: &str) -> Result<BattleOverview, StatsError>;

    /// Full detail for one battle.
    async fn fetch_battle(&self, credential: &str, battle_id: u64)
        -> Result<BattleDetail, StatsError>;

    /// Shareable image URL for one battle.
    async fn fetch_share_url(&self, credential: &str, battle_id: u64)
        -> Result<String, StatsError>;
}

// Canonical models. The upstream JSON is normalized into these once, at the
// client boundary; everything downstream (detector, aggregator, formatting)
// works on this one representation.

#[derive(Debug, Clone, PartialEq)]
pub struct BattleOverview {
    /// Newest first, as delivered by the upstream API.
    pub results: Vec<BattleSummary>,
    pub summary: OverviewSummary,
}

/// One overview entry; just enough to decide whether a battle is new.
#[derive(Debug, Clone, PartialEq)]
pub struct BattleSummary {
    pub battle_id: u64,
    pub victory: bool,
}

/// Rolling aggregate the upstream keeps over the last 50 battles.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OverviewSummary {
    pub victory_count: u32,
    pub defeat_count: u32,
    /// Fraction in `[0, 1]`, not a percentage.
    pub victory_rate: f64,
    pub kill_count_average: f64,
    pub death_count_average: f64,
    pub assist_count_average: f64,
    pub special_count_average: f64,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BattleKind {
    Regular,
    Ranked,
    League,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Rule {
    pub key: String,
    pub name: String,
}

/// Competitive rank (udemae). `s_plus_number` disambiguates the S+ tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rank {
    pub name: String,
    #[serde(default)]
    pub s_plus_number: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Species {
    Inklings,
    Octolings,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Player {
    pub principal_id: String,
    pub nickname: String,
    pub species: Species,
    pub weapon: Option<String>,
    pub rank: Option<Rank>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BattleMember {
    pub kills: u32,
    pub assists: u32,
    pub deaths: u32,
    pub specials: u32,
    pub paint_points: u32,
    /// Upstream scoreboard ordering key.
    pub sort_score: f64,
    pub player: Player,
}

impl BattleMember {
    /// Kills as the upstream scoreboard displays them, assists included.
    pub fn combined_kills(&self) -> u32 {
        self.kills + self.assists
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BattleDetail {
    pub battle_id: u64,
    pub kind: BattleKind,
    pub rule: Rule,
    pub victory: bool,
    pub start_time: DateTime<Utc>,
    /// The subscribed user's own scoreboard row.
    pub me: BattleMember,
    /// Own team including `me`, ordered the way the in-game scoreboard
    /// orders it.
    pub my_team: Vec<BattleMember>,
    pub other_team: Vec<BattleMember>,
    pub my_team_percentage: Option<f64>,
    pub other_team_percentage: Option<f64>,
    pub my_league_point: Option<f64>,
    pub other_league_point: Option<f64>,
    pub gachi_power: Option<f64>,
}

// Wire-level structs, private to the client.

#[derive(Debug, Deserialize)]
struct WireOverview {
    summary: OverviewSummary,
    results: Vec<WireOverviewEntry>,
}

#[derive(Debug, Deserialize)]
struct WireOverviewEntry {
    battle_number: String,
    my_team_result: WireTeamResult,
}

#[derive(Debug, Deserialize)]
struct WireTeamResult {
    key: String,
}

#[derive(Debug, Deserialize)]
struct WireBattle {
    battle_number: String,
    #[serde(rename = "type")]
    battle_type: String,
    rule: Rule,
    my_team_result: WireTeamResult,
    start_time: i64,
    player_result: WireMember,
    #[serde(default)]
    my_team_members: Vec<WireMember>,
    #[serde(default)]
    other_team_members: Vec<WireMember>,
    #[serde(default)]
    my_team_percentage: Option<f64>,
    #[serde(default)]
    other_team_percentage: Option<f64>,
    #[serde(default)]
    my_estimate_league_point: Option<f64>,
    #[serde(default)]
    other_estimate_league_point: Option<f64>,
    #[serde(default)]
    estimate_gachi_power: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct WireMember {
    kill_count: u32,
    assist_count: u32,
    death_count: u32,
    special_count: u32,
    #[serde(default)]
    game_paint_point: u32,
    #[serde(default)]
    sort_score: f64,
    player: WirePlayer,
}

#[derive(Debug, Deserialize)]
struct WirePlayer {
    principal_id: String,
    nickname: String,
    #[serde(default)]
    player_type: Option<WirePlayerType>,
    #[serde(default)]
    udemae: Option<Rank>,
    #[serde(default)]
    weapon: Option<WireWeapon>,
}

#[derive(Debug, Deserialize)]
struct WirePlayerType {
    species: String,
}

#[derive(Debug, Deserialize)]
struct WireWeapon {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireShare {
    url: String,
}

fn parse_battle_id(raw: &str) -> Result<u64, StatsError> {
    raw.parse::<u64>().map_err(|_| StatsError::Transient {
        message: format!("battle number {raw:?} is not numeric"),
    })
}

impl WireOverviewEntry {
    fn into_summary(self) -> Result<BattleSummary, StatsError> {
        Ok(BattleSummary {
            battle_id: parse_battle_id(&self.battle_number)?,
            victory: self.my_team_result.key == "victory",
        })
    }
}

impl WireMember {
    fn into_member(self) -> BattleMember {
        let species = match self.player.player_type {
            Some(ref t) if t.species == "octolings" => Species::Octolings,
            _ => Species::Inklings,
        };
        BattleMember {
            kills: self.kill_count,
            assists: self.assist_count,
            deaths: self.death_count,
            specials: self.special_count,
            paint_points: self.game_paint_point,
            sort_score: self.sort_score,
            player: Player {
                principal_id: self.player.principal_id,
                nickname: self.player.nickname,
                species,
                weapon: self.player.weapon.map(|w| w.name),
                rank: self.player.udemae,
            },
        }
    }
}

impl WireBattle {
    fn into_detail(self) -> Result<BattleDetail, StatsError> {
        let battle_id = parse_battle_id(&self.battle_number)?;
        let kind = match self.battle_type.as_str() {
            "regular" => BattleKind::Regular,
            "gachi" => BattleKind::Ranked,
            "league" => BattleKind::League,
            other => {
                return Err(StatsError::Transient {
                    message: format!("unknown battle type {other:?} in battle {battle_id}"),
                })
            }
        };
        let victory = self.my_team_result.key == "victory";
        let start_time = DateTime::from_timestamp(self.start_time, 0).unwrap_or_default();

        let me = self.player_result.into_member();
        let mut my_team: Vec<BattleMember> = self
            .my_team_members
            .into_iter()
            .map(WireMember::into_member)
            .collect();
        my_team.push(me.clone());
        let mut other_team: Vec<BattleMember> = self
            .other_team_members
            .into_iter()
            .map(WireMember::into_member)
            .collect();

        // League scoreboards order by combined kills, everything else by the
        // upstream sort score.
        let sort = |team: &mut Vec<BattleMember>| {
            if kind == BattleKind::League {
                team.sort_by(|a, b| {
                    (b.combined_kills(), b.kills).cmp(&(a.combined_kills(), a.kills))
                });
            } else {
                team.sort_by(|a, b| b.sort_score.total_cmp(&a.sort_score));
            }
        };
        sort(&mut my_team);
        sort(&mut other_team);

        Ok(BattleDetail {
            battle_id,
            kind,
            rule: self.rule,
            victory,
            start_time,
            me,
            my_team,
            other_team,
            my_team_percentage: self.my_team_percentage,
            other_team_percentage: self.other_team_percentage,
            my_league_point: self.my_estimate_league_point,
            other_league_point: self.other_estimate_league_point,
            gachi_power: self.estimate_gachi_power,
        })
    }
}

/// Reqwest-backed [`BattleFetcher`] against the real stats API.
///
/// The session credential travels as the upstream's session cookie; a 403
/// means the credential was rejected, anything else unexpected is transient.
pub struct StatsClient {
    http: Client,
    base_url: String,
}

impl StatsClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client for the stats API")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
        })
    }

    pub fn default_base_url() -> &'static str {
        DEFAULT_API_BASE
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        credential: &str,
    ) -> Result<T, StatsError> {
        let url = format!("{base}{path}", base = self.base_url);
        let response = self
            .http
            .request(method, &url)
            .header(header::COOKIE, format!("iksm_session={credential}"))
            .header(header::ACCEPT, "application/json")
            .header("X-Requested-With", "XMLHttpRequest")
            .send()
            .await
            .map_err(|err| StatsError::Transient {
                message: format!("request to {path} failed: {err}"),
            })?;

        let status = response.status();
        if status == StatusCode::FORBIDDEN {
            return Err(StatsError::SessionInvalid);
        }
        if !status.is_success() {
            return Err(StatsError::Transient {
                message: format!("unexpected status {status} from {path}"),
            });
        }

        response.json::<T>().await.map_err(|err| StatsError::Transient {
            message: format!("failed to decode {path} response: {err}"),
        })
    }
}

#[async_trait]
impl BattleFetcher for StatsClient {
    async fn fetch_overview(&self, credential: &str) -> Result<BattleOverview, StatsError> {
        let wire: WireOverview = self
            .request_json(Method::GET, "/api/results", credential)
            .await?;
        let results = wire
            .results
            .into_iter()
            .map(WireOverviewEntry::into_summary)
            .collect::<Result<Vec<_>, _>>()?;
        debug!(
            "fetched battle overview with {count} results",
            count = results.len()
        );
        Ok(BattleOverview {
            results,
            summary: wire.summary,
        })
    }

    async fn fetch_battle(
        &self,
        credential: &str,
        battle_id: u64,
    ) -> Result<BattleDetail, StatsError> {
        let wire: WireBattle = self
            .request_json(Method::GET, &format!("/api/results/{battle_id}"), credential)
            .await?;
        wire.into_detail()
    }

    async fn fetch_share_url(
        &self,
        credential: &str,
        battle_id: u64,
    ) -> Result<String, StatsError> {
        let wire: WireShare = self
            .request_json(
                Method::POST,
                &format!("/api/share/results/{battle_id}"),
                credential,
            )
            .await?;
        Ok(wire.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn member_json(principal_id: &str, nickname: &str, kills: u32, paint: u32) -> serde_json::Value {
        json!({
            "kill_count": kills,
            "assist_count": 1,
            "death_count": 2,
            "special_count": 1,
            "game_paint_point": paint,
            "sort_score": paint,
            "player": {
                "principal_id": principal_id,
                "nickname": nickname,
                "player_type": {"species": "inklings", "style": "girl"},
                "udemae": {"name": "S", "s_plus_number": null},
                "weapon": {"name": "Splattershot"}
            }
        })
    }

    fn battle_json(battle_number: &str, victory: bool) -> serde_json::Value {
        json!({
            "battle_number": battle_number,
            "type": "gachi",
            "rule": {"key": "tower_control", "name": "Tower Control"},
            "game_mode": {"key": "gachi", "name": "Ranked Battle"},
            "my_team_result": {"key": if victory { "victory" } else { "defeat" }},
            "start_time": 1_700_000_000,
            "estimate_gachi_power": 2100.0,
            "player_result": member_json("me", "captain", 7, 900),
            "my_team_members": [member_json("m1", "mate", 4, 1100)],
            "other_team_members": [member_json("o1", "rival", 5, 1000)]
        })
    }

    fn overview_json() -> serde_json::Value {
        json!({
            "unique_id": "5000000000",
            "summary": {
                "victory_count": 30,
                "defeat_count": 20,
                "victory_rate": 0.6,
                "kill_count_average": 7.5,
                "death_count_average": 6.1,
                "assist_count_average": 1.2,
                "special_count_average": 2.0,
                "count": 50
            },
            "results": [battle_json("101", true), battle_json("100", false)]
        })
    }

    #[tokio::test]
    async fn overview_decodes_into_canonical_model() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/results")
            .match_header("cookie", "iksm_session=secret")
            .with_status(200)
            .with_body(overview_json().to_string())
            .create_async()
            .await;

        let client = StatsClient::new(server.url()).unwrap();
        let overview = client.fetch_overview("secret").await.unwrap();

        assert_eq!(overview.results.len(), 2);
        assert_eq!(overview.results[0].battle_id, 101);
        assert!(overview.results[0].victory);
        assert_eq!(overview.results[1].battle_id, 100);
        assert!(!overview.results[1].victory);
        assert_eq!(overview.summary.victory_count, 30);
        assert_eq!(overview.summary.count, 50);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn forbidden_maps_to_session_invalid() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/results")
            .with_status(403)
            .create_async()
            .await;

        let client = StatsClient::new(server.url()).unwrap();
        let err = client.fetch_overview("stale").await.unwrap_err();
        assert!(matches!(err, StatsError::SessionInvalid));
    }

    #[tokio::test]
    async fn server_errors_are_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/results")
            .with_status(502)
            .create_async()
            .await;

        let client = StatsClient::new(server.url()).unwrap();
        let err = client.fetch_overview("secret").await.unwrap_err();
        assert!(matches!(err, StatsError::Transient { .. }));
    }

    #[tokio::test]
    async fn malformed_body_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/results")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let client = StatsClient::new(server.url()).unwrap();
        let err = client.fetch_overview("secret").await.unwrap_err();
        assert!(matches!(err, StatsError::Transient { .. }));
    }

    #[tokio::test]
    async fn battle_detail_includes_own_row_in_team() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/results/101")
            .with_status(200)
            .with_body(battle_json("101", true).to_string())
            .create_async()
            .await;

        let client = StatsClient::new(server.url()).unwrap();
        let detail = client.fetch_battle("secret", 101).await.unwrap();

        assert_eq!(detail.battle_id, 101);
        assert_eq!(detail.kind, BattleKind::Ranked);
        assert!(detail.victory);
        assert_eq!(detail.me.player.principal_id, "me");
        assert_eq!(detail.my_team.len(), 2);
        assert!(detail
            .my_team
            .iter()
            .any(|m| m.player.principal_id == "me"));
        // Non-league teams are ordered by the upstream sort score.
        assert_eq!(detail.my_team[0].player.principal_id, "m1");
        assert_eq!(detail.gachi_power, Some(2100.0));
        assert_eq!(detail.me.player.rank, Some(Rank { name: "S".into(), s_plus_number: None }));
    }

    #[tokio::test]
    async fn share_url_comes_from_post_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/share/results/101")
            .with_status(200)
            .with_body(json!({"url": "https://share.example/abc"}).to_string())
            .create_async()
            .await;

        let client = StatsClient::new(server.url()).unwrap();
        let url = client.fetch_share_url("secret", 101).await.unwrap();
        assert_eq!(url, "https://share.example/abc");
        mock.assert_async().await;
    }

    #[test]
    fn non_numeric_battle_number_is_rejected() {
        let err = parse_battle_id("abc").unwrap_err();
        assert!(matches!(err, StatsError::Transient { .. }));
    }

    #[test]
    fn non_league_teams_order_by_sort_score_not_paint() {
        let mut battle = battle_json("300", true);
        // Less paint but a higher sort score still leads the block.
        battle["my_team_members"][0]["game_paint_point"] = json!(100);
        battle["my_team_members"][0]["sort_score"] = json!(2000);
        let wire: WireBattle = serde_json::from_value(battle).unwrap();
        let detail = wire.into_detail().unwrap();
        assert_eq!(detail.my_team[0].player.principal_id, "m1");
        assert_eq!(detail.my_team[1].player.principal_id, "me");
    }

    #[test]
    fn league_teams_order_by_combined_kills() {
        let mut battle = battle_json("200", true);
        battle["type"] = json!("league");
        battle["my_estimate_league_point"] = json!(2300.0);
        battle["other_estimate_league_point"] = json!(2250.0);
        let wire: WireBattle = serde_json::from_value(battle).unwrap();
        let detail = wire.into_detail().unwrap();
        assert_eq!(detail.kind, BattleKind::League);
        // "me" has 7 kills vs 4 for the teammate, so leads despite less paint.
        assert_eq!(detail.my_team[0].player.principal_id, "me");
        assert_eq!(detail.my_league_point, Some(2300.0));
    }
}

//! Push message composition over the canonical battle models.
//!
//! One formatting function per message type; everything renders to Markdown
//! with the transport handling the plain-text fallback.

use crate::notify::OutgoingMessage;
use crate::poll::PollState;
use crate::stats_api::{BattleDetail, BattleKind, BattleMember, Rank, Species};

/// A streak is only worth mentioning from three in a row.
pub const STREAK_DISPLAY_THRESHOLD: i32 = 3;

/// Rank ladder, worst to best. S+ tiers share the "S+" name and are ordered
/// by their number.
const RANK_LADDER: [&str; 12] = [
    "C-", "C", "C+", "B-", "B", "B+", "A-", "A", "A+", "S", "S+", "X",
];

fn rank_level(rank: &Rank) -> Option<(usize, u32)> {
    let level = RANK_LADDER.iter().position(|name| *name == rank.name)?;
    Some((level, rank.s_plus_number.unwrap_or(0)))
}

fn rank_label(rank: &Rank) -> String {
    match rank.s_plus_number {
        Some(number) => format!("{name}{number}", name = rank.name),
        None => rank.name.clone(),
    }
}

/// Rank-change line for the push message, or `None` when the rank did not
/// move (or either rank is unknown to the ladder).
pub fn rank_change_line(rule_name: &str, nickname: &str, old: &Rank, new: &Rank) -> Option<String> {
    let old_level = rank_level(old)?;
    let new_level = rank_level(new)?;
    if old_level == new_level {
        return None;
    }
    let (change, icon) = if new_level > old_level {
        ("RankUp", "⬆️")
    } else {
        ("RankDown", "⬇️")
    };
    Some(format!(
        "{icon} #{change} *{nickname}* `{rule_name}` {old} -> {new}",
        nickname = escape_nickname(nickname),
        old = rank_label(old),
        new = rank_label(new),
    ))
}

/// Compares a ranked battle's rank against the one stored on the poll and
/// advances the stored rank/rule. Best-effort: unranked battles and rule
/// switches produce no line.
pub fn note_rank_change(poll: &mut PollState, detail: &BattleDetail) -> Option<String> {
    if detail.kind != BattleKind::Ranked {
        return None;
    }
    let new_rank = detail.me.player.rank.clone()?;
    let line = match (&poll.last_rank, &poll.last_rule) {
        (Some(old), Some(rule)) if *rule == detail.rule.key => rank_change_line(
            &detail.rule.name,
            &detail.me.player.nickname,
            old,
            &new_rank,
        ),
        _ => None,
    };
    poll.last_rank = Some(new_rank);
    poll.last_rule = Some(detail.rule.key.clone());
    line
}

/// Streak qualifier for the push message, shown only once a run reaches
/// [`STREAK_DISPLAY_THRESHOLD`].
pub fn streak_qualifier(streak: i32) -> Option<String> {
    if streak.abs() < STREAK_DISPLAY_THRESHOLD {
        return None;
    }
    if streak > 0 {
        Some(format!("🔥 `{streak} wins in a row`"))
    } else {
        Some(format!("🧊 `{losses} losses in a row`", losses = -streak))
    }
}

/// Composes the battle push sent after each newly detected battle. Expects
/// the poll's counters to already include this battle.
pub fn push_battle(
    detail: &BattleDetail,
    poll: &PollState,
    rank_line: Option<String>,
) -> OutgoingMessage {
    let mut lines = Vec::new();

    lines.push(if detail.victory {
        "We won! 🎉".to_string()
    } else {
        "We lost... 😿".to_string()
    });

    let defeats = poll.game_count - poll.win_count;
    lines.push(format!(
        "`win rate {rate:.1}% · {wins}W {defeats}L`",
        rate = poll.win_rate(),
        wins = poll.win_count,
    ));

    if let Some(qualifier) = streak_qualifier(poll.streak) {
        lines.push(qualifier);
    }

    match detail.kind {
        BattleKind::Ranked => {
            let rank = detail
                .me
                .player
                .rank
                .as_ref()
                .map(rank_label)
                .unwrap_or_default();
            let power = detail
                .gachi_power
                .map(|p| format!("  power {p:.0}"))
                .unwrap_or_default();
            lines.push(format!(
                "`{rule}: {rank}{power}`",
                rule = detail.rule.name
            ));
        }
        BattleKind::League => {
            let point = detail
                .my_league_point
                .map(|p| format!("  league point {p:.0}"))
                .unwrap_or_default();
            lines.push(format!("`{rule}{point}`", rule = detail.rule.name));
        }
        BattleKind::Regular => {}
    }

    if let Some(line) = rank_line {
        lines.push(line);
    }

    // Winning team block first.
    let (top_team, bottom_team, top_is_mine) = if detail.victory {
        (&detail.my_team, &detail.other_team, true)
    } else {
        (&detail.other_team, &detail.my_team, false)
    };

    lines.push(team_title(detail, top_is_mine));
    lines.extend(top_team.iter().map(|m| member_line(detail, m)));
    lines.push(team_title(detail, !top_is_mine));
    lines.extend(bottom_team.iter().map(|m| member_line(detail, m)));

    OutgoingMessage::markdown(lines.join("\n"))
}

fn kind_label(kind: BattleKind) -> &'static str {
    match kind {
        BattleKind::Regular => "Regular",
        BattleKind::Ranked => "Ranked",
        BattleKind::League => "League",
    }
}

fn team_title(detail: &BattleDetail, my_team: bool) -> String {
    let won = detail.victory == my_team;
    let title = if won { "VICTORY" } else { "DEFEAT" };

    let score = match detail.kind {
        BattleKind::Regular => {
            let percentage = if my_team {
                detail.my_team_percentage
            } else {
                detail.other_team_percentage
            };
            percentage.map(|p| format!(" {p:.1}")).unwrap_or_default()
        }
        BattleKind::League => {
            let point = if my_team {
                detail.my_league_point
            } else {
                detail.other_league_point
            };
            point.map(|p| format!(" {p:.0}")).unwrap_or_default()
        }
        BattleKind::Ranked => String::new(),
    };

    format!("{title} {mode}{score}:", mode = kind_label(detail.kind))
}

fn member_line(detail: &BattleDetail, member: &BattleMember) -> String {
    let mut nickname = format!("`{}`", escape_nickname(&member.player.nickname));
    if member.player.principal_id == detail.me.player.principal_id {
        nickname.push_str(" 👨🏻‍✈️");
    }

    // Turf war scoreboards carry no rank; fall back to the species icon.
    match &member.player.rank {
        Some(rank) => format!(
            "`{rank:<2}|{combined:>2} {kills:>2}+{assists}k` `{deaths:>2}d {specials}sp` {nickname}",
            rank = rank.name,
            combined = member.combined_kills(),
            kills = member.kills,
            assists = member.assists,
            deaths = member.deaths,
            specials = member.specials,
        ),
        None => {
            let avatar = match member.player.species {
                Species::Octolings => "🐙",
                Species::Inklings => "🦑",
            };
            format!(
                "{avatar}`{combined:>2}({assists})k` `{deaths:>2}d {specials}sp` {nickname}",
                combined = member.combined_kills(),
                assists = member.assists,
                deaths = member.deaths,
                specials = member.specials,
            )
        }
    }
}

fn escape_nickname(nickname: &str) -> String {
    // Backticks would break out of the inline code span.
    nickname.replace('`', "'")
}

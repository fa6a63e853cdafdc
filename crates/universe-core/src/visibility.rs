//! Computes which characters must learn about an event, and why.

use contracts::RecipientReason;

/// One ship owner present in a sector.
#[derive(Debug, Clone)]
pub struct SectorPresence {
    pub character_id: String,
    pub in_hyperspace: bool,
}

/// The sector's garrison owner plus the active members of their corporation.
#[derive(Debug, Clone, Default)]
pub struct GarrisonPresence {
    pub owner_id: String,
    pub corp_member_ids: Vec<String>,
}

/// Union of direct recipients, present non-hyperspace ship owners, the
/// garrison owner, and the garrison owner's active corp-mates. First reason
/// encountered wins for a given character; blank ids are dropped rather than
/// erroring; excluded ids never appear.
pub fn compute_event_recipients(
    direct: &[(String, RecipientReason)],
    sector_ships: &[SectorPresence],
    garrison: Option<&GarrisonPresence>,
    exclude: &[String],
) -> Vec<(String, RecipientReason)> {
    let mut recipients: Vec<(String, RecipientReason)> = Vec::new();

    let mut push = |character_id: &str, reason: RecipientReason| {
        let trimmed = character_id.trim();
        if trimmed.is_empty() {
            return;
        }
        if exclude.iter().any(|excluded| excluded == trimmed) {
            return;
        }
        if recipients.iter().any(|(existing, _)| existing == trimmed) {
            return;
        }
        recipients.push((trimmed.to_string(), reason));
    };

    for (character_id, reason) in direct {
        push(character_id, *reason);
    }

    for presence in sector_ships {
        if presence.in_hyperspace {
            continue;
        }
        push(&presence.character_id, RecipientReason::SectorSnapshot);
    }

    if let Some(garrison) = garrison {
        push(&garrison.owner_id, RecipientReason::GarrisonOwner);
        for member_id in &garrison.corp_member_ids {
            if member_id == &garrison.owner_id {
                continue;
            }
            push(member_id, RecipientReason::GarrisonCorpMember);
        }
    }

    recipients
}

#[cfg(test)]
mod tests {
    use super::*;

    fn present(character_id: &str) -> SectorPresence {
        SectorPresence {
            character_id: character_id.to_string(),
            in_hyperspace: false,
        }
    }

    #[test]
    fn unions_all_sources_with_first_reason_winning() {
        let direct = vec![("alice".to_string(), RecipientReason::Sender)];
        let ships = vec![present("alice"), present("bob")];
        let garrison = GarrisonPresence {
            owner_id: "bob".to_string(),
            corp_member_ids: vec!["bob".to_string(), "carol".to_string()],
        };

        let recipients = compute_event_recipients(&direct, &ships, Some(&garrison), &[]);

        assert_eq!(
            recipients,
            vec![
                ("alice".to_string(), RecipientReason::Sender),
                ("bob".to_string(), RecipientReason::SectorSnapshot),
                ("carol".to_string(), RecipientReason::GarrisonCorpMember),
            ]
        );
    }

    #[test]
    fn hyperspace_ships_and_blank_ids_are_dropped() {
        let ships = vec![
            SectorPresence {
                character_id: "jumper".to_string(),
                in_hyperspace: true,
            },
            SectorPresence {
                character_id: "  ".to_string(),
                in_hyperspace: false,
            },
            present("dana"),
        ];

        let recipients = compute_event_recipients(&[], &ships, None, &[]);
        assert_eq!(
            recipients,
            vec![("dana".to_string(), RecipientReason::SectorSnapshot)]
        );
    }

    #[test]
    fn excluded_characters_never_appear() {
        let ships = vec![present("dana"), present("erin")];
        let recipients =
            compute_event_recipients(&[], &ships, None, &["dana".to_string()]);
        assert_eq!(
            recipients,
            vec![("erin".to_string(), RecipientReason::SectorSnapshot)]
        );
    }
}

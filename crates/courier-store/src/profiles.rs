use std::str::FromStr;

use chrono::Utc;
use rusqlite::{params, OptionalExtension};

use courier_shared::{Identity, Tier, UserId};

use crate::database::Database;
use crate::error::Result;

impl Database {
    pub fn upsert_profile(&self, profile: &Identity) -> Result<()> {
        self.conn().execute(
            "INSERT INTO profiles (user_id, email, display_name, photo_url, tier, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id) DO UPDATE SET
                email = excluded.email,
                display_name = excluded.display_name,
                photo_url = excluded.photo_url,
                tier = excluded.tier,
                updated_at = excluded.updated_at",
            params![
                profile.user_id.as_str(),
                profile.email,
                profile.display_name,
                profile.photo_url,
                profile.tier.as_str(),
                Utc::now().timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    pub fn get_profile(&self, user_id: &UserId) -> Result<Option<Identity>> {
        let profile = self
            .conn()
            .query_row(
                "SELECT email, display_name, photo_url, tier FROM profiles WHERE user_id = ?1",
                params![user_id.as_str()],
                |row| {
                    let tier: String = row.get(3)?;
                    Ok(Identity {
                        user_id: user_id.clone(),
                        email: row.get(0)?,
                        display_name: row.get(1)?,
                        photo_url: row.get(2)?,
                        // Unknown tiers read back as the lowest tier.
                        tier: Tier::from_str(&tier).unwrap_or_default(),
                    })
                },
            )
            .optional()?;
        Ok(profile)
    }
}

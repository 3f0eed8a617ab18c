use chrono::NaiveDateTime;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::database::schema::age_verifications;

pub const STATUS_VERIFIED: &str = "verified";

#[derive(Queryable, Selectable, Insertable, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[diesel(table_name = age_verifications)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct AgeVerification {
    pub user_id: String,
    pub guild_id: String,
    pub is_21_plus: bool,
    pub status: String, // pending | verified | rejected
    pub verified_at: Option<NaiveDateTime>,
    pub expires_at: Option<NaiveDateTime>,
}

impl AgeVerification {
    pub fn find(
        conn: &mut SqliteConnection,
        user_id: &str,
        guild_id: &str,
    ) -> QueryResult<Option<AgeVerification>> {
        age_verifications::table
            .find((user_id, guild_id))
            .select(AgeVerification::as_select())
            .first(conn)
            .optional()
    }

    /// Insert or replace the verification record for a member.
    pub fn upsert(conn: &mut SqliteConnection, record: &AgeVerification) -> QueryResult<usize> {
        diesel::replace_into(age_verifications::table)
            .values(record)
            .execute(conn)
    }
}

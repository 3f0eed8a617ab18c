use chrono::NaiveDateTime;
use diesel::dsl::{max, sum};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};

use crate::database::schema::music_queue;

#[derive(Queryable, Selectable, Identifiable, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[diesel(table_name = music_queue)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct QueueEntry {
    pub id: i32,
    pub session_id: i32,
    pub position: i32,
    pub url: String,
    pub title: String,
    pub duration: Option<i32>,
    pub requested_by: String,
    pub source: String,
    pub is_cannabis_content: bool,
    pub metadata: String, // JSON object
    pub added_at: NaiveDateTime,
    pub played_at: Option<NaiveDateTime>,
    pub removed_at: Option<NaiveDateTime>,
}

#[derive(Insertable)]
#[diesel(table_name = music_queue)]
pub struct NewQueueEntry {
    pub session_id: i32,
    pub position: i32,
    pub url: String,
    pub title: String,
    pub duration: Option<i32>,
    pub requested_by: String,
    pub source: String,
    pub is_cannabis_content: bool,
    pub metadata: String,
    pub added_at: NaiveDateTime,
    pub played_at: Option<NaiveDateTime>,
}

impl QueueEntry {
    /// Highest position ever handed out in a session, including played and
    /// removed rows.
    pub fn max_position(conn: &mut SqliteConnection, session_id: i32) -> QueryResult<i32> {
        music_queue::table
            .filter(music_queue::session_id.eq(session_id))
            .select(max(music_queue::position))
            .first::<Option<i32>>(conn)
            .map(|pos| pos.unwrap_or(0))
    }

    pub fn insert(conn: &mut SqliteConnection, entry: &NewQueueEntry) -> QueryResult<QueueEntry> {
        diesel::insert_into(music_queue::table)
            .values(entry)
            .returning(QueueEntry::as_returning())
            .get_result(conn)
    }

    pub fn find_by_id(conn: &mut SqliteConnection, id: i32) -> QueryResult<Option<QueueEntry>> {
        music_queue::table
            .find(id)
            .select(QueueEntry::as_select())
            .first(conn)
            .optional()
    }

    /// Lowest-position entry that is neither played nor removed.
    pub fn next_unplayed(
        conn: &mut SqliteConnection,
        session_id: i32,
    ) -> QueryResult<Option<QueueEntry>> {
        Self::pending(session_id)
            .order(music_queue::position.asc())
            .select(QueueEntry::as_select())
            .first(conn)
            .optional()
    }

    pub fn upcoming(
        conn: &mut SqliteConnection,
        session_id: i32,
        limit: i64,
    ) -> QueryResult<Vec<QueueEntry>> {
        Self::pending(session_id)
            .order(music_queue::position.asc())
            .limit(limit)
            .select(QueueEntry::as_select())
            .load(conn)
    }

    pub fn all_unplayed(
        conn: &mut SqliteConnection,
        session_id: i32,
    ) -> QueryResult<Vec<QueueEntry>> {
        Self::pending(session_id)
            .order(music_queue::position.asc())
            .select(QueueEntry::as_select())
            .load(conn)
    }

    pub fn history(
        conn: &mut SqliteConnection,
        session_id: i32,
        limit: i64,
    ) -> QueryResult<Vec<QueueEntry>> {
        music_queue::table
            .filter(music_queue::session_id.eq(session_id))
            .filter(music_queue::played_at.is_not_null())
            .order(music_queue::position.asc())
            .limit(limit)
            .select(QueueEntry::as_select())
            .load(conn)
    }

    pub fn find_unplayed_at(
        conn: &mut SqliteConnection,
        session_id: i32,
        position: i32,
    ) -> QueryResult<Option<QueueEntry>> {
        Self::pending(session_id)
            .filter(music_queue::position.eq(position))
            .select(QueueEntry::as_select())
            .first(conn)
            .optional()
    }

    pub fn mark_played(
        conn: &mut SqliteConnection,
        id: i32,
        played_at: NaiveDateTime,
    ) -> QueryResult<usize> {
        diesel::update(music_queue::table.find(id))
            .filter(music_queue::played_at.is_null())
            .set(music_queue::played_at.eq(Some(played_at)))
            .execute(conn)
    }

    pub fn mark_removed(
        conn: &mut SqliteConnection,
        id: i32,
        removed_at: NaiveDateTime,
    ) -> QueryResult<usize> {
        diesel::update(music_queue::table.find(id))
            .filter(music_queue::removed_at.is_null())
            .set(music_queue::removed_at.eq(Some(removed_at)))
            .execute(conn)
    }

    pub fn remove_all_unplayed(
        conn: &mut SqliteConnection,
        session_id: i32,
        removed_at: NaiveDateTime,
    ) -> QueryResult<usize> {
        diesel::update(Self::pending(session_id))
            .set(music_queue::removed_at.eq(Some(removed_at)))
            .execute(conn)
    }

    pub fn set_position(conn: &mut SqliteConnection, id: i32, position: i32) -> QueryResult<usize> {
        diesel::update(music_queue::table.find(id))
            .set(music_queue::position.eq(position))
            .execute(conn)
    }

    pub fn count_live(conn: &mut SqliteConnection, session_id: i32) -> QueryResult<i64> {
        music_queue::table
            .filter(music_queue::session_id.eq(session_id))
            .filter(music_queue::removed_at.is_null())
            .count()
            .get_result(conn)
    }

    pub fn count_played(conn: &mut SqliteConnection, session_id: i32) -> QueryResult<i64> {
        music_queue::table
            .filter(music_queue::session_id.eq(session_id))
            .filter(music_queue::removed_at.is_null())
            .filter(music_queue::played_at.is_not_null())
            .count()
            .get_result(conn)
    }

    pub fn count_unplayed(conn: &mut SqliteConnection, session_id: i32) -> QueryResult<i64> {
        Self::pending(session_id).count().get_result(conn)
    }

    pub fn unplayed_duration_secs(conn: &mut SqliteConnection, session_id: i32) -> QueryResult<i64> {
        Self::pending(session_id)
            .select(sum(music_queue::duration))
            .first::<Option<i64>>(conn)
            .map(|total| total.unwrap_or(0))
    }

    fn pending(session_id: i32) -> PendingQuery {
        music_queue::table
            .filter(music_queue::session_id.eq(session_id))
            .filter(music_queue::played_at.is_null())
            .filter(music_queue::removed_at.is_null())
    }
}

type PendingQuery = diesel::dsl::Filter<
    diesel::dsl::Filter<
        diesel::dsl::Filter<music_queue::table, diesel::dsl::Eq<music_queue::session_id, i32>>,
        diesel::dsl::IsNull<music_queue::played_at>,
    >,
    diesel::dsl::IsNull<music_queue::removed_at>,
>;

// Kept in sync by hand with database/migrations.rs.

diesel::table! {
    music_sessions (id) {
        id -> Integer,
        guild_id -> Text,
        voice_channel_id -> Text,
        text_channel_id -> Text,
        started_by -> Text,
        session_type -> Text,
        status -> Text,
        is_cannabis_content -> Bool,
        requires_21_plus -> Bool,
        current_track_index -> Integer,
        volume -> Integer,
        metadata -> Text,
        started_at -> Timestamp,
        ended_at -> Nullable<Timestamp>,
    }
}

diesel::table! {
    music_queue (id) {
        id -> Integer,
        session_id -> Integer,
        position -> Integer,
        url -> Text,
        title -> Text,
        duration -> Nullable<Integer>,
        requested_by -> Text,
        source -> Text,
        is_cannabis_content -> Bool,
        metadata -> Text,
        added_at -> Timestamp,
        played_at -> Nullable<Timestamp>,
        removed_at -> Nullable<Timestamp>,
    }
}

diesel::table! {
    user_music_preferences (id) {
        id -> Integer,
        user_id -> Text,
        guild_id -> Text,
        preferred_volume -> Integer,
        cannabis_music_enabled -> Bool,
        blocked_sources -> Text,
        favorite_genres -> Text,
        explicit_content_filter -> Bool,
        created_at -> Timestamp,
        updated_at -> Timestamp,
    }
}

diesel::table! {
    age_verifications (user_id, guild_id) {
        user_id -> Text,
        guild_id -> Text,
        is_21_plus -> Bool,
        status -> Text,
        verified_at -> Nullable<Timestamp>,
        expires_at -> Nullable<Timestamp>,
    }
}

diesel::joinable!(music_queue -> music_sessions (session_id));

diesel::allow_tables_to_appear_in_same_query!(
    age_verifications,
    music_queue,
    music_sessions,
    user_music_preferences,
);

// Table definitions for the per-user SQLite store. Timestamps are stored
// as RFC 3339 text (TimestamptzSqlite); event times stay raw ISO-8601 text
// because all-day events carry date-only values.

diesel::table! {
    schema_migrations (version) {
        version -> Integer,
        name -> Text,
        applied_at -> TimestamptzSqlite,
    }
}

diesel::table! {
    canonical_events (canonical_event_id) {
        canonical_event_id -> Text,
        origin_account_id -> Text,
        origin_event_id -> Text,
        title -> Text,
        description -> Nullable<Text>,
        location -> Nullable<Text>,
        start_ts -> Text,
        end_ts -> Text,
        timezone -> Nullable<Text>,
        all_day -> Bool,
        status -> Text,
        visibility -> Text,
        transparency -> Text,
        recurrence_rule -> Nullable<Text>,
        source -> Text,
        version -> BigInt,
        constraint_id -> Nullable<Text>,
        payload_hash -> Text,
        created_at -> TimestamptzSqlite,
        updated_at -> TimestamptzSqlite,
    }
}

diesel::table! {
    event_mirrors (mirror_id) {
        mirror_id -> Text,
        canonical_event_id -> Text,
        target_account_id -> Text,
        target_calendar_id -> Text,
        provider_event_id -> Nullable<Text>,
        last_projected_hash -> Nullable<Text>,
        desired_payload -> Nullable<Text>,
        state -> Text,
        error -> Nullable<Text>,
        attempt_count -> Integer,
        next_retry_at -> Nullable<TimestamptzSqlite>,
        last_write_ts -> Nullable<TimestamptzSqlite>,
        created_at -> TimestamptzSqlite,
        updated_at -> TimestamptzSqlite,
    }
}

diesel::table! {
    constraints (constraint_id) {
        constraint_id -> Text,
        kind -> Text,
        config_json -> Text,
        active_from -> Nullable<TimestamptzSqlite>,
        active_to -> Nullable<TimestamptzSqlite>,
        created_at -> TimestamptzSqlite,
        updated_at -> TimestamptzSqlite,
    }
}

diesel::table! {
    journal_entries (id) {
        id -> BigInt,
        canonical_event_id -> Text,
        change_type -> Text,
        actor -> Text,
        patch -> Text,
        ts -> TimestamptzSqlite,
    }
}

diesel::table! {
    event_participants (id) {
        id -> BigInt,
        canonical_event_id -> Text,
        participant_hash -> Text,
        display_name -> Nullable<Text>,
        response_status -> Nullable<Text>,
    }
}

diesel::table! {
    relationships (relationship_id) {
        relationship_id -> Text,
        participant_hash -> Text,
        email -> Text,
        display_name -> Text,
        city -> Nullable<Text>,
        cadence_days -> Nullable<Integer>,
        last_interaction_ts -> Nullable<TimestamptzSqlite>,
        created_at -> TimestamptzSqlite,
        updated_at -> TimestamptzSqlite,
    }
}

diesel::table! {
    ledger_entries (ledger_id) {
        ledger_id -> Text,
        participant_hash -> Text,
        outcome -> Text,
        note -> Nullable<Text>,
        ts -> TimestamptzSqlite,
    }
}

diesel::table! {
    milestones (milestone_id) {
        milestone_id -> Text,
        participant_hash -> Nullable<Text>,
        title -> Text,
        month -> Integer,
        day -> Integer,
        year -> Nullable<Integer>,
        recurring -> Bool,
        created_at -> TimestamptzSqlite,
    }
}

diesel::table! {
    scheduling_sessions (session_id) {
        session_id -> Text,
        status -> Text,
        title -> Text,
        duration_minutes -> Integer,
        candidates_json -> Text,
        selected_candidate_id -> Nullable<Text>,
        created_at -> TimestamptzSqlite,
        expires_at -> TimestamptzSqlite,
        updated_at -> TimestamptzSqlite,
    }
}

diesel::table! {
    holds (hold_id) {
        hold_id -> Text,
        session_id -> Text,
        candidate_id -> Text,
        target_account_id -> Text,
        target_calendar_id -> Text,
        start_ts -> Text,
        end_ts -> Text,
        status -> Text,
        provider_event_id -> Nullable<Text>,
        expires_at -> TimestamptzSqlite,
        created_at -> TimestamptzSqlite,
        updated_at -> TimestamptzSqlite,
    }
}

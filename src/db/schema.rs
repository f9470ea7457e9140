//! Table definitions for the four logical databases.

/// `clients.db` — one row per distinct client identity.
pub const CLIENTS: &[&str] = &["CREATE TABLE IF NOT EXISTS clients (
        id INTEGER PRIMARY KEY,
        ip_address TEXT NOT NULL,
        port INTEGER NOT NULL,
        role TEXT NOT NULL,
        start_timestamp INTEGER NOT NULL,
        cuda_device TEXT NOT NULL
    )"];

/// `self_play.db` — game records, per-gen aggregates, MCTS counters.
pub const SELF_PLAY: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS games (
        id INTEGER PRIMARY KEY,
        client_id INTEGER NOT NULL,
        gen INTEGER NOT NULL,
        start_timestamp INTEGER NOT NULL,
        end_timestamp INTEGER NOT NULL,
        augmented_positions INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS games_gen_index ON games (gen)",
    "CREATE TABLE IF NOT EXISTS self_play_metadata (
        gen INTEGER PRIMARY KEY,
        games INTEGER NOT NULL DEFAULT 0,
        augmented_positions INTEGER NOT NULL DEFAULT 0,
        runtime INTEGER NOT NULL DEFAULT 0,
        positions_evaluated INTEGER NOT NULL DEFAULT 0,
        batches_evaluated INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS metrics (
        client_id INTEGER NOT NULL,
        gen INTEGER NOT NULL,
        report_timestamp INTEGER NOT NULL,
        cache_hits INTEGER NOT NULL,
        cache_misses INTEGER NOT NULL,
        positions_evaluated INTEGER NOT NULL,
        batches_evaluated INTEGER NOT NULL,
        full_batches_evaluated INTEGER NOT NULL
    )",
];

/// `training.db` — one row per committed generation, plus per-head stats.
pub const TRAINING: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS training (
        gen INTEGER PRIMARY KEY,
        start_timestamp INTEGER NOT NULL,
        end_timestamp INTEGER NOT NULL,
        minibatches INTEGER NOT NULL,
        window_size INTEGER NOT NULL,
        total_loss REAL NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS training_heads (
        gen INTEGER NOT NULL,
        head TEXT NOT NULL,
        accuracy_num REAL NOT NULL,
        loss_num REAL NOT NULL,
        den INTEGER NOT NULL,
        PRIMARY KEY (gen, head)
    )",
];

/// `ratings.db` — raw match records and per-gen rating summaries.
pub const RATINGS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS matches (
        id INTEGER PRIMARY KEY,
        mcts_gen INTEGER NOT NULL,
        ref_strength INTEGER NOT NULL,
        n_games INTEGER NOT NULL,
        wins INTEGER NOT NULL,
        draws INTEGER NOT NULL,
        losses INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS ratings (
        mcts_gen INTEGER PRIMARY KEY,
        n_games INTEGER NOT NULL,
        rating REAL NOT NULL
    )",
];

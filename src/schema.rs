use rusqlite_migration::{M, Migrations};
use std::sync::LazyLock;

pub static MIGRATIONS: LazyLock<Migrations<'static>> = LazyLock::new(|| {
    Migrations::new(vec![
        M::up(
            "
CREATE TABLE customers (
    id          INTEGER PRIMARY KEY,
    user_id     INTEGER UNIQUE,
    email       TEXT NOT NULL UNIQUE,
    is_premium  INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE ticket_categories (
    id          INTEGER PRIMARY KEY,
    name        TEXT NOT NULL UNIQUE
);

CREATE TABLE tickets (
    id              INTEGER PRIMARY KEY,
    customer_id     INTEGER NOT NULL REFERENCES customers(id) ON DELETE CASCADE,
    subject         TEXT NOT NULL,
    description     TEXT NOT NULL,
    status          TEXT NOT NULL DEFAULT 'O' CHECK (status IN ('O', 'P', 'C')),
    priority        TEXT NOT NULL CHECK (priority IN ('H', 'M', 'L')),
    category_id     INTEGER REFERENCES ticket_categories(id) ON DELETE SET NULL,
    created_at      INTEGER NOT NULL,
    updated_at      INTEGER NOT NULL,
    sentiment_score REAL
);

CREATE TABLE knowledge_base (
    id          INTEGER PRIMARY KEY,
    title       TEXT NOT NULL,
    content     TEXT NOT NULL,
    embedding   BLOB NOT NULL,
    dimension   INTEGER NOT NULL CHECK (dimension > 0)
);

CREATE TABLE knowledge_base_categories (
    kb_id       INTEGER NOT NULL REFERENCES knowledge_base(id) ON DELETE CASCADE,
    category_id INTEGER NOT NULL REFERENCES ticket_categories(id) ON DELETE CASCADE,
    PRIMARY KEY (kb_id, category_id)
);

-- Indexes
CREATE INDEX idx_customers_premium ON customers(is_premium) WHERE is_premium = 1;
CREATE INDEX idx_tickets_customer ON tickets(customer_id);
CREATE INDEX idx_tickets_status_priority ON tickets(status, priority);
CREATE INDEX idx_tickets_created ON tickets(created_at);
CREATE INDEX idx_tickets_subject ON tickets(subject);
CREATE INDEX idx_tickets_open ON tickets(created_at) WHERE status = 'O';
CREATE INDEX idx_kb_title ON knowledge_base(title);
",
        ),
    ])
});

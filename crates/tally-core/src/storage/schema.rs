//! Table definitions for both backends. Column names and semantics are
//! kept identical so `ResultStore` callers stay backend-agnostic.

pub const SQLITE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS runs (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  started_at TEXT NOT NULL,
  model TEXT NOT NULL DEFAULT '',
  model_release TEXT,
  suite TEXT NOT NULL,
  commit_sha TEXT,
  branch TEXT,
  pipeline_url TEXT,
  runner TEXT,
  runner_tags TEXT,
  total INTEGER NOT NULL DEFAULT 0,
  passed INTEGER NOT NULL DEFAULT 0,
  failed INTEGER NOT NULL DEFAULT 0,
  skipped INTEGER NOT NULL DEFAULT 0,
  duration_seconds REAL NOT NULL DEFAULT 0,
  harness_version TEXT,
  temperature REAL,
  seed INTEGER,
  top_p REAL,
  top_k INTEGER,
  wall_seconds REAL,
  cost_usd REAL
);

CREATE INDEX IF NOT EXISTS idx_runs_pipeline_url ON runs(pipeline_url);

CREATE TABLE IF NOT EXISTS results (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id INTEGER NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
  test_name TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pass', 'fail', 'skip')),
  score REAL CHECK (score IS NULL OR (score >= 0.0 AND score <= 1.0)),
  question TEXT,
  expected TEXT,
  actual TEXT,
  reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_results_run_id ON results(run_id);

CREATE TABLE IF NOT EXISTS pipelines (
  pipeline_id INTEGER PRIMARY KEY,
  status TEXT NOT NULL,
  ref_name TEXT,
  sha TEXT,
  url TEXT,
  created_at TEXT,
  updated_at TEXT,
  duration_seconds REAL,
  job_count INTEGER NOT NULL DEFAULT 0,
  artifact_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS models (
  model TEXT PRIMARY KEY,
  last_tested_at TEXT NOT NULL
);
"#;

pub const POSTGRES_DDL: &str = "
CREATE TABLE IF NOT EXISTS runs (
  id BIGSERIAL PRIMARY KEY,
  started_at TEXT NOT NULL,
  model TEXT NOT NULL DEFAULT '',
  model_release TEXT,
  suite TEXT NOT NULL,
  commit_sha TEXT,
  branch TEXT,
  pipeline_url TEXT,
  runner TEXT,
  runner_tags TEXT,
  total BIGINT NOT NULL DEFAULT 0,
  passed BIGINT NOT NULL DEFAULT 0,
  failed BIGINT NOT NULL DEFAULT 0,
  skipped BIGINT NOT NULL DEFAULT 0,
  duration_seconds DOUBLE PRECISION NOT NULL DEFAULT 0,
  harness_version TEXT,
  temperature DOUBLE PRECISION,
  seed BIGINT,
  top_p DOUBLE PRECISION,
  top_k BIGINT,
  wall_seconds DOUBLE PRECISION,
  cost_usd DOUBLE PRECISION
);

CREATE INDEX IF NOT EXISTS idx_runs_pipeline_url ON runs(pipeline_url);

CREATE TABLE IF NOT EXISTS results (
  id BIGSERIAL PRIMARY KEY,
  run_id BIGINT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
  test_name TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('pass', 'fail', 'skip')),
  score DOUBLE PRECISION CHECK (score IS NULL OR (score >= 0.0 AND score <= 1.0)),
  question TEXT,
  expected TEXT,
  actual TEXT,
  reason TEXT
);

CREATE INDEX IF NOT EXISTS idx_results_run_id ON results(run_id);

CREATE TABLE IF NOT EXISTS pipelines (
  pipeline_id BIGINT PRIMARY KEY,
  status TEXT NOT NULL,
  ref_name TEXT,
  sha TEXT,
  url TEXT,
  created_at TEXT,
  updated_at TEXT,
  duration_seconds DOUBLE PRECISION,
  job_count BIGINT NOT NULL DEFAULT 0,
  artifact_count BIGINT NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS models (
  model TEXT PRIMARY KEY,
  last_tested_at TEXT NOT NULL
);
";

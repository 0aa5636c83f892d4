use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Upstream tables grouped by upstream schema.
pub type UpTables = BTreeMap<String, BTreeSet<String>>;

/// The full membership snapshot: task, then source, then routing.
pub type SourceTablesMap = HashMap<String, HashMap<String, SourceTables>>;

/// The upstream tables one source routes into one downstream table under a
/// task.
///
/// Value-typed snapshot; equality is structural.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetTable {
    pub task: String,
    pub source: String,
    pub down_schema: String,
    pub down_table: String,
    pub up_tables: UpTables,
}

impl TargetTable {
    pub fn new(
        task: impl Into<String>,
        source: impl Into<String>,
        down_schema: impl Into<String>,
        down_table: impl Into<String>,
        up_tables: UpTables,
    ) -> Self {
        Self {
            task: task.into(),
            source: source.into(),
            down_schema: down_schema.into(),
            down_table: down_table.into(),
            up_tables,
        }
    }
}

/// One routing quad: an upstream table feeding a downstream table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct TableRoute {
    pub down_schema: String,
    pub down_table: String,
    pub up_schema: String,
    pub up_table: String,
}

/// Every table a single source replicates under a task, keyed by the
/// downstream target it is routed into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceTables {
    pub task: String,
    pub source: String,
    /// When set, an update removes this source's record instead of merging it.
    pub is_deleted: bool,
    /// down_schema -> down_table -> up_schema -> up_tables.
    pub tables: BTreeMap<String, BTreeMap<String, UpTables>>,
}

impl SourceTables {
    pub fn new(task: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            task: task.into(),
            source: source.into(),
            is_deleted: false,
            tables: BTreeMap::new(),
        }
    }

    /// Records that `up_schema`.`up_table` is routed into
    /// `down_schema`.`down_table`. Returns true iff the row was newly created.
    pub fn add_table(
        &mut self,
        up_schema: &str,
        up_table: &str,
        down_schema: &str,
        down_table: &str,
    ) -> bool {
        self.tables
            .entry(down_schema.to_string())
            .or_default()
            .entry(down_table.to_string())
            .or_default()
            .entry(up_schema.to_string())
            .or_default()
            .insert(up_table.to_string())
    }

    /// Removes a routing row. Returns true iff a row was removed.
    pub fn remove_table(
        &mut self,
        up_schema: &str,
        up_table: &str,
        down_schema: &str,
        down_table: &str,
    ) -> bool {
        let Some(down_tables) = self.tables.get_mut(down_schema) else {
            return false;
        };
        let Some(up_schemas) = down_tables.get_mut(down_table) else {
            return false;
        };
        let Some(up_tables) = up_schemas.get_mut(up_schema) else {
            return false;
        };

        let removed = up_tables.remove(up_table);
        if up_tables.is_empty() {
            up_schemas.remove(up_schema);
        }
        if up_schemas.is_empty() {
            down_tables.remove(down_table);
        }
        if down_tables.is_empty() {
            self.tables.remove(down_schema);
        }
        removed
    }

    /// Projects this source's contribution to one downstream table.
    ///
    /// The result may have empty `up_tables` when the source routes nothing
    /// into the target.
    pub fn target_table(&self, down_schema: &str, down_table: &str) -> TargetTable {
        let up_tables = self
            .tables
            .get(down_schema)
            .and_then(|down_tables| down_tables.get(down_table))
            .cloned()
            .unwrap_or_default();

        TargetTable::new(
            self.task.clone(),
            self.source.clone(),
            down_schema,
            down_table,
            up_tables,
        )
    }

    /// Returns every routing quad this record holds.
    fn routes(&self) -> BTreeSet<TableRoute> {
        let mut routes = BTreeSet::new();
        for (down_schema, down_tables) in &self.tables {
            for (down_table, up_schemas) in down_tables {
                for (up_schema, up_tables) in up_schemas {
                    for up_table in up_tables {
                        routes.insert(TableRoute {
                            down_schema: down_schema.clone(),
                            down_table: down_table.clone(),
                            up_schema: up_schema.clone(),
                            up_table: up_table.clone(),
                        });
                    }
                }
            }
        }
        routes
    }
}

/// Collects the target tables every source under `task` contributes to one
/// downstream table, from a membership snapshot.
///
/// Pure function used during lock creation so the lock knows the full
/// membership it must wait for. Returns `None` for an unknown task and an
/// empty vector for a known task with no matching routing; lock creation
/// needs the distinction, other callers treat both as "nothing".
pub fn target_tables_for_task(
    task: &str,
    down_schema: &str,
    down_table: &str,
    stm: &SourceTablesMap,
) -> Option<Vec<TargetTable>> {
    let sources = stm.get(task)?;

    let mut tts: Vec<TargetTable> = sources
        .values()
        .map(|st| st.target_table(down_schema, down_table))
        .filter(|tt| !tt.up_tables.is_empty())
        .collect();
    tts.sort_by(|a, b| a.source.cmp(&b.source));
    Some(tts)
}

/// Inner state of [`TableKeeper`].
#[derive(Debug, Default)]
struct TableKeeperInner {
    /// task -> source -> the source's routing record.
    tables: SourceTablesMap,
}

/// Process-wide index of [`SourceTables`] keyed by task and source.
///
/// [`TableKeeper`] answers "which upstreams currently feed this downstream
/// table?" and emits add/drop deltas when a source's routing record is
/// replaced. All methods are safe under concurrent callers.
#[derive(Debug, Clone, Default)]
pub struct TableKeeper {
    inner: Arc<RwLock<TableKeeperInner>>,
}

impl TableKeeper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the internal state with `snapshot`; `None` is equivalent to an
    /// empty snapshot. Idempotent.
    pub async fn init(&self, snapshot: Option<SourceTablesMap>) {
        let mut inner = self.inner.write().await;
        inner.tables = snapshot.unwrap_or_default();
    }

    /// Merges one source's routing record into the index and returns the
    /// `(added, dropped)` routing quads relative to the stored record.
    ///
    /// A record with `is_deleted` removes the stored record and returns all of
    /// its quads as dropped; deleting an unknown record is a no-op. An unknown
    /// task is only created by non-delete updates.
    pub async fn update(&self, st: SourceTables) -> (Vec<TableRoute>, Vec<TableRoute>) {
        let mut inner = self.inner.write().await;

        if st.is_deleted {
            let Some(sources) = inner.tables.get_mut(&st.task) else {
                return (Vec::new(), Vec::new());
            };
            let Some(old) = sources.remove(&st.source) else {
                return (Vec::new(), Vec::new());
            };

            debug!(task = %st.task, source = %st.source, "removed source tables");
            return (Vec::new(), old.routes().into_iter().collect());
        }

        let sources = inner.tables.entry(st.task.clone()).or_default();
        let old_routes = sources
            .get(&st.source)
            .map(|old| old.routes())
            .unwrap_or_default();
        let new_routes = st.routes();

        let added = new_routes.difference(&old_routes).cloned().collect();
        let dropped = old_routes.difference(&new_routes).cloned().collect();
        sources.insert(st.source.clone(), st);

        (added, dropped)
    }

    /// Records a single routing row. Returns true iff the row was newly
    /// created.
    ///
    /// An unknown task returns false (tasks are not auto-created here); an
    /// unknown source within an existing task gets a fresh record.
    pub async fn add_table(
        &self,
        task: &str,
        source: &str,
        up_schema: &str,
        up_table: &str,
        down_schema: &str,
        down_table: &str,
    ) -> bool {
        let mut inner = self.inner.write().await;
        let Some(sources) = inner.tables.get_mut(task) else {
            return false;
        };

        sources
            .entry(source.to_string())
            .or_insert_with(|| SourceTables::new(task, source))
            .add_table(up_schema, up_table, down_schema, down_table)
    }

    /// Removes a single routing row. Returns true iff a row was removed;
    /// unknown task or source returns false.
    pub async fn remove_table(
        &self,
        task: &str,
        source: &str,
        up_schema: &str,
        up_table: &str,
        down_schema: &str,
        down_table: &str,
    ) -> bool {
        let mut inner = self.inner.write().await;
        let Some(sources) = inner.tables.get_mut(task) else {
            return false;
        };
        let Some(st) = sources.get_mut(source) else {
            return false;
        };

        st.remove_table(up_schema, up_table, down_schema, down_table)
    }

    /// Returns the target tables contributed by every source under `task`
    /// that currently routes any upstream into the downstream table, ordered
    /// by source name.
    pub async fn find_tables(
        &self,
        task: &str,
        down_schema: &str,
        down_table: &str,
    ) -> Vec<TargetTable> {
        let inner = self.inner.read().await;
        target_tables_for_task(task, down_schema, down_table, &inner.tables).unwrap_or_default()
    }

    /// Returns every target table one source contributes under a task, across
    /// all downstream targets, ordered by downstream name.
    pub async fn find_tables_by_task_and_source(
        &self,
        task: &str,
        source: &str,
    ) -> Vec<TargetTable> {
        let inner = self.inner.read().await;
        let Some(st) = inner.tables.get(task).and_then(|s| s.get(source)) else {
            return Vec::new();
        };

        st.tables
            .iter()
            .flat_map(|(down_schema, down_tables)| {
                down_tables
                    .keys()
                    .map(|down_table| st.target_table(down_schema, down_table))
            })
            .collect()
    }

    /// Drops every record under `task`. Returns true iff the task existed.
    pub async fn remove_table_by_task(&self, task: &str) -> bool {
        let mut inner = self.inner.write().await;
        inner.tables.remove(task).is_some()
    }

    /// Drops the records of the given sources under `task`. Unknown tasks and
    /// sources are ignored.
    pub async fn remove_table_by_task_and_sources(&self, task: &str, sources: &[String]) {
        let mut inner = self.inner.write().await;
        if let Some(task_sources) = inner.tables.get_mut(task) {
            for source in sources {
                task_sources.remove(source);
            }
        }
    }

    /// Point query: is this exact routing row present? Stable under concurrent
    /// updates.
    pub async fn source_table_exist(
        &self,
        task: &str,
        source: &str,
        up_schema: &str,
        up_table: &str,
        down_schema: &str,
        down_table: &str,
    ) -> bool {
        let inner = self.inner.read().await;
        inner
            .tables
            .get(task)
            .and_then(|sources| sources.get(source))
            .and_then(|st| st.tables.get(down_schema))
            .and_then(|down_tables| down_tables.get(down_table))
            .and_then(|up_schemas| up_schemas.get(up_schema))
            .is_some_and(|up_tables| up_tables.contains(up_table))
    }
}

//! Concurrent access to one shared store handle

use alembic::settings::keys;
use alembic::{NewPrompt, Phase, PromptStore, SearchFilter, SemanticQuery};
use std::sync::Arc;
use tempfile::TempDir;

const WRITERS: usize = 4;
const PER_WRITER: usize = 25;

#[test]
fn test_parallel_writers_and_readers() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let store = Arc::new(
        PromptStore::open(temp_dir.path().join("shared.db")).expect("Failed to open store"),
    );

    std::thread::scope(|scope| {
        for writer in 0..WRITERS {
            let store = Arc::clone(&store);
            scope.spawn(move || {
                for i in 0..PER_WRITER {
                    let angle = (writer * PER_WRITER + i) as f32 / 100.0;
                    store
                        .create(
                            &NewPrompt::new(
                                format!("w{}-{}", writer, i),
                                Phase::Solutio,
                                format!("provider-{}", writer),
                                "gpt-4o",
                            )
                            .with_embedding(vec![angle.cos(), angle.sin()], "m"),
                        )
                        .expect("Concurrent create should succeed");
                }
            });
        }

        for _ in 0..2 {
            let store = Arc::clone(&store);
            scope.spawn(move || {
                for _ in 0..10 {
                    let results = store
                        .search_semantic(&SemanticQuery::new(vec![1.0, 0.0]).limit(5))
                        .expect("Concurrent search should succeed");
                    let similarities = results.similarities.unwrap_or_default();
                    assert!(similarities.windows(2).all(|w| w[0] >= w[1]));
                }
            });
        }
    });

    assert_eq!(store.prompts().count().unwrap(), (WRITERS * PER_WRITER) as u64);
    for writer in 0..WRITERS {
        let mine = store
            .search_text(
                &SearchFilter::new()
                    .provider(format!("provider-{}", writer))
                    .limit(100),
            )
            .unwrap();
        assert_eq!(mine.len(), PER_WRITER);
    }
}

#[test]
fn test_maintenance_races_with_usage() {
    let store = Arc::new(PromptStore::open_in_memory().unwrap());
    let ids: Vec<_> = (0..40)
        .map(|i| {
            store
                .create(
                    &NewPrompt::new(format!("p{}", i), Phase::PrimaMateria, "openai", "gpt-4o")
                        .with_relevance(0.5),
                )
                .unwrap()
        })
        .collect();
    store.config().set(keys::MAX_PROMPTS, 30).unwrap();

    std::thread::scope(|scope| {
        let usage_store = Arc::clone(&store);
        let usage_ids = ids.clone();
        scope.spawn(move || {
            for id in &usage_ids {
                // cleanup may already have evicted this record
                let _ = usage_store.prompts().record_usage(id);
            }
        });

        let maintenance_store = Arc::clone(&store);
        scope.spawn(move || {
            maintenance_store
                .run_maintenance(&Default::default())
                .expect("Maintenance should succeed");
        });
    });

    assert!(store.prompts().count().unwrap() <= 30);
    let edges: i64 = store
        .database()
        .read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM prompt_relationships",
                [],
                |row| row.get(0),
            )?)
        })
        .unwrap();
    assert_eq!(edges, 0);
}

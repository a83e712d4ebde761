//! Integration tests for semantic search through the store API

use alembic::{NewPrompt, Phase, PromptStore, SearchFilter, SemanticQuery};
use approx::assert_relative_eq;

fn embedded(content: &str, phase: Phase, vector: Vec<f32>, model: &str) -> NewPrompt {
    NewPrompt::new(content, phase, "openai", "gpt-4o").with_embedding(vector, model)
}

#[test]
fn test_threshold_scenario() {
    let store = PromptStore::open_in_memory().expect("Failed to open store");

    let first = store
        .create(&embedded("first", Phase::Solutio, vec![1.0, 0.0], "m"))
        .unwrap();
    store
        .create(&embedded("second", Phase::Solutio, vec![0.0, 1.0], "m"))
        .unwrap();

    let results = store
        .search_semantic(&SemanticQuery::new(vec![1.0, 0.0]).min_similarity(0.5))
        .expect("Search should succeed");

    assert_eq!(results.len(), 1);
    assert_eq!(results.prompts[0].id, first);
    assert_relative_eq!(results.similarities.unwrap()[0], 1.0, epsilon = 1e-6);
}

#[test]
fn test_results_ordered_and_above_threshold() {
    let store = PromptStore::open_in_memory().expect("Failed to open store");

    let vectors = [
        vec![0.9, 0.1, 0.0],
        vec![0.5, 0.5, 0.0],
        vec![0.1, 0.9, 0.0],
        vec![0.0, 0.0, 1.0],
        vec![0.7, 0.2, 0.1],
        vec![-1.0, 0.0, 0.0],
    ];
    for (i, vector) in vectors.iter().enumerate() {
        store
            .create(&embedded(&format!("p{}", i), Phase::PrimaMateria, vector.clone(), "m"))
            .unwrap();
    }

    for threshold in [0.0, 0.3, 0.6, 0.95] {
        let results = store
            .search_semantic(&SemanticQuery::new(vec![1.0, 0.0, 0.0]).min_similarity(threshold))
            .expect("Search should succeed");
        let similarities = results.similarities.expect("semantic results carry scores");

        assert_eq!(similarities.len(), results.prompts.len());
        assert!(
            similarities.windows(2).all(|w| w[0] >= w[1]),
            "similarities not sorted: {:?}",
            similarities
        );
        assert!(similarities.iter().all(|s| *s >= threshold));
    }
}

#[test]
fn test_dimension_isolation() {
    let store = PromptStore::open_in_memory().expect("Failed to open store");

    store
        .create(&embedded("old generation", Phase::Solutio, vec![1.0; 4], "old"))
        .unwrap();
    let current = store
        .create(&embedded("new generation", Phase::Solutio, vec![1.0; 3], "new"))
        .unwrap();

    let results = store
        .search_semantic(&SemanticQuery::new(vec![1.0; 3]))
        .expect("Search should succeed");

    assert_eq!(results.len(), 1);
    assert_eq!(results.prompts[0].id, current);
    assert!(results
        .prompts
        .iter()
        .all(|p| p.embedding_dimensions == Some(3)));
}

#[test]
fn test_semantic_search_applies_filters() {
    let store = PromptStore::open_in_memory().expect("Failed to open store");

    store
        .create(
            &embedded("tagged idea", Phase::PrimaMateria, vec![1.0, 0.0], "m")
                .with_tags(["keep"]),
        )
        .unwrap();
    store
        .create(&embedded("untagged idea", Phase::PrimaMateria, vec![1.0, 0.0], "m"))
        .unwrap();
    store
        .create(&embedded("tagged polish", Phase::Coagulatio, vec![1.0, 0.0], "m").with_tags(["keep"]))
        .unwrap();

    let query = SemanticQuery::new(vec![1.0, 0.0]).filter(
        SearchFilter::new()
            .phase(Phase::PrimaMateria)
            .tags(["keep"]),
    );
    let results = store.search_semantic(&query).expect("Search should succeed");

    assert_eq!(results.len(), 1);
    assert_eq!(results.prompts[0].content, "tagged idea");
}

#[test]
fn test_reembedded_record_becomes_searchable() {
    let store = PromptStore::open_in_memory().expect("Failed to open store");

    let id = store
        .create(&embedded("legacy", Phase::Solutio, vec![0.5; 6], "A"))
        .unwrap();
    store.migrate("B", 2, 10).expect("Migration should succeed");
    assert!(store
        .search_semantic(&SemanticQuery::new(vec![0.5, 0.5]))
        .unwrap()
        .is_empty());

    let pending = store.prompts().list_without_embeddings(10).unwrap();
    assert_eq!(pending.len(), 1);

    store
        .update(
            &id,
            &alembic::PromptUpdate {
                embedding: Some(alembic::storage::EmbeddingUpdate {
                    vector: vec![0.5, 0.5],
                    model: "B".to_string(),
                }),
                ..Default::default()
            },
        )
        .unwrap();

    let results = store
        .search_semantic(&SemanticQuery::new(vec![0.5, 0.5]).min_similarity(0.99))
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results.prompts[0].id, id);
}

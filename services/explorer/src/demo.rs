//! Sample data for running the explorer without a database.

use schema::{Dataset, ReviewLogEntry, Row};
use store::{InMemoryStore, StoreResult};

pub const DEMO_EPOCH: &str = "20240301";

const REVIEWERS: [&str; 3] = ["alice", "bob", "carol"];
const LANGUAGES: [&str; 4] = ["en", "en,de", "fr", "de,fr"];

/// Builds a store holding every dataset at [`DEMO_EPOCH`], with `rows` base rows
/// each and a review logged for every third row.
pub fn seeded_store(rows: usize) -> StoreResult<InMemoryStore> {
    let store = InMemoryStore::new();
    for dataset in Dataset::ALL {
        store.add_dataset(dataset.as_str(), &[DEMO_EPOCH])?;
        let tables = dataset.tables(DEMO_EPOCH);
        store.create_table(&tables.log)?;

        let mut base = Vec::with_capacity(rows);
        let mut log = Vec::new();
        for i in 0..rows {
            let languages = LANGUAGES[i % LANGUAGES.len()];
            let reviewer = REVIEWERS[i % REVIEWERS.len()];
            let decision = if i % 2 == 0 { "approve" } else { "reject" };
            let changetime = format!("2024-03-{:02} 12:00:00", 1 + (i / 3) % 28);
            match dataset {
                Dataset::CatfactsMissingProperty => {
                    let id = format!("F{i}");
                    let entity = format!("Q{}", 1000 + i / 4);
                    let category = format!("C{}", i % 5);
                    let property = format!("P{}", 100 + i % 7);
                    base.push(Row::category_fact(
                        &id,
                        &entity,
                        &category,
                        &property,
                        "missing",
                        &format!("https://example.org/ref/{i}"),
                        languages,
                    ));
                    if i % 3 == 0 {
                        log.push(ReviewLogEntry::category_fact(
                            &id, &entity, &category, &property, reviewer, decision, &changetime,
                        ));
                    }
                }
                _ => {
                    let q_number = format!("Q{}", 1 + i);
                    base.push(Row::missing_value(
                        &q_number,
                        "missing",
                        &format!("https://example.org/ref/{i}"),
                        languages,
                    ));
                    if i % 3 == 0 {
                        log.push(ReviewLogEntry::missing_value(
                            &q_number,
                            reviewer,
                            decision,
                            &changetime,
                        ));
                    }
                }
            }
        }
        store.insert_rows(&tables.base, base)?;
        store.insert_log_entries(&tables.log, log)?;
    }
    Ok(store)
}

#[cfg(test)]
mod tests {
    use super::*;
    use store::DatasetStore;

    #[tokio::test]
    async fn every_dataset_is_listed_with_the_demo_epoch() {
        let store = seeded_store(9).unwrap();
        let mut listed = store.list_datasets().await.unwrap();
        listed.sort();
        assert_eq!(listed.len(), Dataset::ALL.len());
        for dataset in Dataset::ALL {
            assert_eq!(
                store.dataset_epochs(dataset.as_str()).await.unwrap(),
                vec![DEMO_EPOCH.to_string()]
            );
        }
    }
}

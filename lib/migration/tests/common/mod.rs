use bson::{doc, Bson};
use migration::cluster::{Chunk, CollectionMetadata};
use migration::namespace::Namespace;
use migration::testing::{legacy_chunk_id, two_shard_clusters, InMemoryCluster};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn collection_namespace() -> Namespace {
    Namespace::new("db1", "coll")
}

/// Source with `db1` (primary `src1`) and `db1.coll` sharded on `{_id: 1}` into four chunks
/// alternating between `src0` and `src1`. The destination has no databases.
pub fn source_with_split_collection() -> (InMemoryCluster, InMemoryCluster) {
    let (source, destination) = two_shard_clusters();
    let ns = collection_namespace();

    source.add_database("db1", "src1");
    source.add_database_on_shard("src1", "db1");
    source.add_collection(CollectionMetadata::new(ns.clone(), doc! { "_id": 1 }, false));

    let bounds = [
        doc! { "_id": Bson::MinKey },
        doc! { "_id": 0 },
        doc! { "_id": 10 },
        doc! { "_id": 20 },
        doc! { "_id": Bson::MaxKey },
    ];
    for (i, window) in bounds.windows(2).enumerate() {
        source.add_chunk(Chunk::new(
            legacy_chunk_id(&ns, &window[0]),
            ns.clone(),
            window[0].clone(),
            window[1].clone(),
            format!("src{}", i % 2),
        ));
    }

    (source, destination)
}

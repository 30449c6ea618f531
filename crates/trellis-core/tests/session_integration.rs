//! Integration tests for the unit-of-work session.

use std::sync::Arc;
use trellis_core::driver::{Driver, MemoryDriver};
use trellis_core::schema::{GenericSqlPlatform, SchemaGenerator};
use trellis_core::{
    Cascade, DetachedGraph, DetachedNode, EntityMetadata, EntityProperty, EntityState, Error,
    MetadataRegistry, ScalarType, Session,
};
use trellis_proto::{Criteria, FindOptions, Row, Value};

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

struct TestContext {
    registry: Arc<MetadataRegistry>,
    driver: Arc<MemoryDriver>,
}

impl TestContext {
    fn new() -> Self {
        init_tracing();
        Self {
            registry: Arc::new(blog_registry()),
            driver: Arc::new(MemoryDriver::new()),
        }
    }

    fn session(&self) -> Session {
        Session::new(Arc::clone(&self.registry), Arc::clone(&self.driver) as Arc<dyn Driver>)
    }
}

fn blog_registry() -> MetadataRegistry {
    let user = EntityMetadata::new("User", "id")
        .with_property(EntityProperty::scalar("id", ScalarType::Int64))
        .with_property(EntityProperty::scalar("name", ScalarType::String))
        .with_property(
            EntityProperty::scalar("email", ScalarType::String)
                .nullable()
                .unique(),
        )
        .with_property(
            EntityProperty::one_to_many("posts", "Post", "author").with_cascade(vec![Cascade::All]),
        )
        .with_property(
            EntityProperty::many_to_one("mentor", "User")
                .with_field_name("mentor_id")
                .nullable(),
        );

    let post = EntityMetadata::new("Post", "id")
        .with_property(EntityProperty::scalar("id", ScalarType::Int64))
        .with_property(EntityProperty::scalar("title", ScalarType::String))
        .with_property(
            EntityProperty::many_to_one("author", "User")
                .with_field_name("author_id")
                .with_inverse("posts")
                .nullable(),
        )
        .with_property(
            EntityProperty::many_to_many("tags", "Tag")
                .with_field_name("tag_ids")
                .with_inverse("posts"),
        )
        .with_property(
            EntityProperty::one_to_many("comments", "Comment", "post")
                .with_cascade(vec![Cascade::All])
                .with_orphan_removal(),
        );

    let tag = EntityMetadata::new("Tag", "id")
        .with_property(EntityProperty::scalar("id", ScalarType::Int64))
        .with_property(EntityProperty::scalar("label", ScalarType::String))
        .with_property(EntityProperty::many_to_many("posts", "Post").inverse_side("tags"));

    let comment = EntityMetadata::new("Comment", "id")
        .with_property(EntityProperty::scalar("id", ScalarType::Int64))
        .with_property(EntityProperty::scalar("body", ScalarType::String))
        .with_property(
            EntityProperty::many_to_one("post", "Post")
                .with_field_name("post_id")
                .with_inverse("comments")
                .nullable(),
        );

    MetadataRegistry::builder()
        .entity(user)
        .entity(post)
        .entity(tag)
        .entity(comment)
        .build()
        .unwrap()
}

#[test]
fn identity_stability_within_one_session() {
    let ctx = TestContext::new();
    let mut session = ctx.session();

    let user = session.create("User").unwrap();
    session.set(user, "name", "Jon Snow").unwrap();
    session.persist(user).unwrap();
    session.flush().unwrap();
    let pk = session.pk(user).unwrap().unwrap();

    let found = session.find_by_pk("User", pk.clone()).unwrap().unwrap();
    let again = session.find_by_pk("User", pk).unwrap().unwrap();
    let by_name = session
        .find_one("User", &Criteria::new().eq("name", "Jon Snow"))
        .unwrap()
        .unwrap();

    assert_eq!(found, user);
    assert_eq!(again, user);
    assert_eq!(by_name, user);
    let pk = session.pk(user).unwrap().unwrap();
    assert_eq!(session.identity("User", &pk), Some(user));
}

#[test]
fn init_reference_loads_the_target_stub() {
    let ctx = TestContext::new();
    let mut session = ctx.session();

    let user = session.create("User").unwrap();
    session.set(user, "name", "author").unwrap();
    let post = session.create("Post").unwrap();
    session.set(post, "title", "t").unwrap();
    session.collection_add(user, "posts", post).unwrap();
    session.persist(user).unwrap();
    session.flush().unwrap();
    let post_pk = session.pk(post).unwrap().unwrap();

    session.clear();
    let post = session.find_by_pk("Post", post_pk).unwrap().unwrap();

    // Materializing the post registered an author stub.
    let author = session.init_reference(post, "author").unwrap().unwrap();
    assert!(session.is_initialized(author).unwrap());
    assert_eq!(
        session.get(author, "name").unwrap(),
        Value::String("author".into())
    );

    // Repeated initialization is a no-op and returns the same instance.
    assert_eq!(session.init_reference(post, "author").unwrap(), Some(author));
}

#[test]
fn flush_twice_issues_no_second_write() {
    let ctx = TestContext::new();
    let mut session = ctx.session();

    let user = session.create("User").unwrap();
    session.set(user, "name", "Alice").unwrap();
    session.persist(user).unwrap();

    let first = session.flush().unwrap();
    assert_eq!(first.inserts, 1);

    let second = session.flush().unwrap();
    assert!(second.is_empty());

    // A fresh session that only loads and flushes also writes nothing.
    let mut other = ctx.session();
    other
        .find("User", &Criteria::new(), &FindOptions::new())
        .unwrap();
    assert!(other.flush().unwrap().is_empty());
}

#[test]
fn mutual_reference_cycle_persists_every_entity_once() {
    let ctx = TestContext::new();
    let mut session = ctx.session();

    let a = session.create("User").unwrap();
    let b = session.create("User").unwrap();
    session.set(a, "name", "a").unwrap();
    session.set(b, "name", "b").unwrap();
    session.set_reference(a, "mentor", Some(b)).unwrap();
    session.set_reference(b, "mentor", Some(a)).unwrap();

    session.persist(a).unwrap();
    let report = session.flush().unwrap();

    assert_eq!(report.inserts, 2);
    assert_eq!(ctx.driver.row_count("user"), 2);

    // Both foreign keys point at each other in storage.
    let rows = ctx
        .driver
        .find("user", &Criteria::new(), &FindOptions::new())
        .unwrap();
    for row in rows {
        assert!(!row.get("mentor_id").unwrap().is_null());
    }
}

#[test]
fn self_reference_persists_and_terminates() {
    let ctx = TestContext::new();
    let mut session = ctx.session();

    let a = session.create("User").unwrap();
    session.set(a, "name", "ouroboros").unwrap();
    session.set_reference(a, "mentor", Some(a)).unwrap();
    session.persist(a).unwrap();
    session.flush().unwrap();

    let pk = session.pk(a).unwrap().unwrap();
    let rows = ctx
        .driver
        .find("user", &Criteria::new(), &FindOptions::new())
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("mentor_id"), Some(&pk));
}

#[test]
fn cascade_persist_reaches_collection_members() {
    let ctx = TestContext::new();
    let mut session = ctx.session();

    let user = session.create("User").unwrap();
    session.set(user, "name", "author").unwrap();
    for i in 0..3 {
        let post = session.create("Post").unwrap();
        session.set(post, "title", format!("part {i}").as_str()).unwrap();
        session.collection_add(user, "posts", post).unwrap();
    }

    session.persist(user).unwrap();
    let report = session.flush().unwrap();

    assert_eq!(report.inserts, 4);
    assert_eq!(ctx.driver.row_count("post"), 3);

    // Inserting the posts wrote the owning pointer assigned by the
    // inverse-side append.
    let user_pk = session.pk(user).unwrap().unwrap();
    let rows = ctx
        .driver
        .find("post", &Criteria::new(), &FindOptions::new())
        .unwrap();
    for row in rows {
        assert_eq!(row.get("author_id"), Some(&user_pk));
    }
}

#[test]
fn cascade_remove_deletes_children_first() {
    let ctx = TestContext::new();
    let mut session = ctx.session();

    let user = session.create("User").unwrap();
    session.set(user, "name", "author").unwrap();
    let post = session.create("Post").unwrap();
    session.set(post, "title", "t").unwrap();
    session.collection_add(user, "posts", post).unwrap();
    let comment = session.create("Comment").unwrap();
    session.set(comment, "body", "hi").unwrap();
    session.collection_add(post, "comments", comment).unwrap();
    session.persist(user).unwrap();
    session.flush().unwrap();

    session.remove(user).unwrap();
    let report = session.flush().unwrap();

    assert_eq!(report.deletes, 3);
    assert_eq!(ctx.driver.row_count("user"), 0);
    assert_eq!(ctx.driver.row_count("post"), 0);
    assert_eq!(ctx.driver.row_count("comment"), 0);
    assert_eq!(session.state(user).unwrap(), EntityState::Removed);
}

#[test]
fn orphan_removal_deletes_detached_child_and_readd_recreates_it() {
    let ctx = TestContext::new();
    let mut session = ctx.session();

    let post = session.create("Post").unwrap();
    session.set(post, "title", "t").unwrap();
    let keeper = session.create("Comment").unwrap();
    session.set(keeper, "body", "keep").unwrap();
    let orphan = session.create("Comment").unwrap();
    session.set(orphan, "body", "drop").unwrap();
    session.collection_add(post, "comments", keeper).unwrap();
    session.collection_add(post, "comments", orphan).unwrap();
    session.persist(post).unwrap();
    session.flush().unwrap();
    assert_eq!(ctx.driver.row_count("comment"), 2);

    // Detaching from the orphan-removing collection deletes the child even
    // though nothing called remove().
    session.collection_remove(post, "comments", orphan).unwrap();
    let report = session.flush().unwrap();
    assert_eq!(report.deletes, 1);
    assert_eq!(ctx.driver.row_count("comment"), 1);

    // Re-adding the same instance re-creates the association.
    session.collection_add(post, "comments", orphan).unwrap();
    let report = session.flush().unwrap();
    assert_eq!(report.inserts, 1);
    assert_eq!(ctx.driver.row_count("comment"), 2);
    assert_eq!(session.state(orphan).unwrap(), EntityState::Managed);
}

#[test]
fn removing_detached_member_before_flush_is_not_an_orphan() {
    let ctx = TestContext::new();
    let mut session = ctx.session();

    let post = session.create("Post").unwrap();
    session.set(post, "title", "t").unwrap();
    let comment = session.create("Comment").unwrap();
    session.set(comment, "body", "c").unwrap();
    session.collection_add(post, "comments", comment).unwrap();
    session.persist(post).unwrap();
    session.flush().unwrap();

    // Remove and re-add before flushing: membership is unchanged.
    session.collection_remove(post, "comments", comment).unwrap();
    session.collection_add(post, "comments", comment).unwrap();
    let report = session.flush().unwrap();

    assert_eq!(report.deletes, 0);
    assert_eq!(ctx.driver.row_count("comment"), 1);
}

#[test]
fn many_to_many_order_survives_reload() {
    let ctx = TestContext::new();
    let mut session = ctx.session();

    let post = session.create("Post").unwrap();
    session.set(post, "title", "tagged").unwrap();
    let mut tag_pks = Vec::new();
    for label in ["x", "y", "z"] {
        let tag = session.create("Tag").unwrap();
        session.set(tag, "label", label).unwrap();
        session.collection_add(post, "tags", tag).unwrap();
    }
    assert!(session.is_collection_dirty(post, "tags").unwrap());
    session.persist(post).unwrap();
    session.flush().unwrap();
    assert!(!session.is_collection_dirty(post, "tags").unwrap());
    for item in session.collection_items(post, "tags").unwrap() {
        tag_pks.push(session.pk(item).unwrap().unwrap());
    }
    let post_pk = session.pk(post).unwrap().unwrap();

    session.clear();
    let reloaded = session.find_by_pk("Post", post_pk).unwrap().unwrap();
    assert!(!session.is_collection_initialized(reloaded, "tags").unwrap());

    session.init_collection(reloaded, "tags").unwrap();
    // Clean immediately after initialization.
    assert!(!session.is_collection_dirty(reloaded, "tags").unwrap());
    let identifiers = session.collection_identifiers(reloaded, "tags").unwrap();
    assert_eq!(identifiers, tag_pks);

    // Nothing changed, so a flush after reload writes nothing.
    assert!(session.flush().unwrap().is_empty());
}

#[test]
fn owning_side_appends_identifiers_without_loading() {
    let ctx = TestContext::new();
    let mut session = ctx.session();

    let post = session.create("Post").unwrap();
    session.set(post, "title", "tagged").unwrap();
    let first = session.create("Tag").unwrap();
    session.set(first, "label", "first").unwrap();
    session.collection_add(post, "tags", first).unwrap();
    session.persist(post).unwrap();
    session.flush().unwrap();
    let post_pk = session.pk(post).unwrap().unwrap();
    let first_pk = session.pk(first).unwrap().unwrap();

    // New session: append a freshly created tag to the uninitialized
    // owning collection; existing members are never loaded.
    session.clear();
    let reloaded = session.find_by_pk("Post", post_pk.clone()).unwrap().unwrap();
    let second = session.create("Tag").unwrap();
    session.set(second, "label", "second").unwrap();
    assert!(!session.is_collection_initialized(reloaded, "tags").unwrap());
    session.collection_add(reloaded, "tags", second).unwrap();
    session.flush().unwrap();
    let second_pk = session.pk(second).unwrap().unwrap();

    let rows = ctx
        .driver
        .find(
            "post",
            &Criteria::new().eq("id", post_pk),
            &FindOptions::new(),
        )
        .unwrap();
    assert_eq!(
        rows[0].get("tag_ids"),
        Some(&Value::List(vec![first_pk, second_pk]))
    );
}

#[test]
fn uninitialized_inverse_collection_guards_mutation() {
    let ctx = TestContext::new();
    let mut session = ctx.session();

    let post = session.create("Post").unwrap();
    session.set(post, "title", "tagged").unwrap();
    let tag = session.create("Tag").unwrap();
    session.set(tag, "label", "t").unwrap();
    session.collection_add(post, "tags", tag).unwrap();
    session.persist(post).unwrap();
    session.flush().unwrap();
    let tag_pk = session.pk(tag).unwrap().unwrap();
    let post_pk = session.pk(post).unwrap().unwrap();

    session.clear();
    let tag = session.find_by_pk("Tag", tag_pk).unwrap().unwrap();
    let post = session.find_by_pk("Post", post_pk).unwrap().unwrap();

    assert!(matches!(
        session.collection_add(tag, "posts", post),
        Err(Error::NotInitialized(..))
    ));
    assert!(matches!(
        session.collection_remove(tag, "posts", post),
        Err(Error::NotInitialized(..))
    ));
    assert!(matches!(
        session.collection_contains(tag, "posts", post),
        Err(Error::NotInitialized(..))
    ));
    assert!(matches!(
        session.collection_remove_all(tag, "posts"),
        Err(Error::NotInitialized(..))
    ));

    // After initialization the same calls succeed.
    session.init_collection(tag, "posts").unwrap();
    assert!(session.collection_contains(tag, "posts", post).unwrap());
    assert!(!session.collection_add(tag, "posts", post).unwrap()); // present
    assert!(session.collection_remove(tag, "posts", post).unwrap());
    assert_eq!(session.collection_remove_all(tag, "posts").unwrap(), 0);
}

#[test]
fn find_one_with_empty_criteria_fails_before_io() {
    let ctx = TestContext::new();
    let mut session = ctx.session();

    assert!(matches!(
        session.find_one("User", &Criteria::new()),
        Err(Error::EmptyCriteria)
    ));

    // No match is an explicit None, not an error.
    let missing = session
        .find_one("User", &Criteria::new().eq("name", "nobody"))
        .unwrap();
    assert!(missing.is_none());
}

#[test]
fn fork_shares_registry_but_not_identity_map() {
    let ctx = TestContext::new();
    let mut session = ctx.session();

    let user = session.create("User").unwrap();
    session.set(user, "name", "a").unwrap();
    session.persist(user).unwrap();
    session.flush().unwrap();

    let fork = session.fork();
    assert!(Arc::ptr_eq(session.registry(), fork.registry()));
    assert_eq!(session.identity_map_len(), 1);
    assert_eq!(fork.identity_map_len(), 0);
}

#[test]
fn get_reference_is_initialized_in_place_by_find() {
    let ctx = TestContext::new();
    let mut session = ctx.session();

    let user = session.create("User").unwrap();
    session.set(user, "name", "lazy").unwrap();
    session.persist(user).unwrap();
    session.flush().unwrap();
    let pk = session.pk(user).unwrap().unwrap();

    session.clear();
    let reference = session.get_reference("User", pk.clone()).unwrap();
    assert!(!session.is_initialized(reference).unwrap());

    let found = session.find_by_pk("User", pk).unwrap().unwrap();
    assert_eq!(found, reference);
    assert!(session.is_initialized(reference).unwrap());
    assert_eq!(
        session.get(reference, "name").unwrap(),
        Value::String("lazy".into())
    );
}

#[test]
fn merge_requires_identity() {
    let ctx = TestContext::new();
    let mut session = ctx.session();

    let graph = DetachedGraph::new(
        0,
        vec![DetachedNode {
            entity: "User".into(),
            pk: None,
            values: vec![("name".into(), Value::String("anon".into()))],
            relations: Vec::new(),
        }],
    );

    match session.merge(&graph) {
        Err(Error::MissingIdentity(entity)) => assert_eq!(entity, "User"),
        other => panic!("expected MissingIdentity, got {other:?}"),
    }
}

#[test]
fn detach_and_merge_roundtrip_with_cycle() {
    let ctx = TestContext::new();
    let mut session = ctx.session();

    let user = session.create("User").unwrap();
    session.set(user, "name", "author").unwrap();
    let post = session.create("Post").unwrap();
    session.set(post, "title", "t").unwrap();
    session.collection_add(user, "posts", post).unwrap();
    session.persist(user).unwrap();
    session.flush().unwrap();
    let user_pk = session.pk(user).unwrap().unwrap();

    // The graph is cyclic: user -> posts -> author -> user.
    let graph = session.detach(user).unwrap();
    assert_eq!(graph.len(), 2);

    session.clear();
    let merged = session.merge(&graph).unwrap();
    assert_eq!(session.pk(merged).unwrap().unwrap(), user_pk);
    assert_eq!(
        session.get(merged, "name").unwrap(),
        Value::String("author".into())
    );
    let posts = session.collection_items(merged, "posts").unwrap();
    assert_eq!(posts.len(), 1);
    assert_eq!(session.reference(posts[0], "author").unwrap(), Some(merged));

    // Merged state counts as persisted: nothing to flush.
    assert!(session.flush().unwrap().is_empty());

    // Merging the same graph again materializes no second instance.
    let again = session.merge(&graph).unwrap();
    assert_eq!(again, merged);
}

#[test]
fn remove_then_persist_cancels_the_deletion() {
    let ctx = TestContext::new();
    let mut session = ctx.session();

    let user = session.create("User").unwrap();
    session.set(user, "name", "a").unwrap();
    session.persist(user).unwrap();
    session.flush().unwrap();

    session.remove(user).unwrap();
    session.persist(user).unwrap(); // last operation wins
    let report = session.flush().unwrap();

    assert_eq!(report.deletes, 0);
    assert_eq!(ctx.driver.row_count("user"), 1);
    assert_eq!(session.state(user).unwrap(), EntityState::Managed);
}

#[test]
fn removing_never_persisted_entity_makes_no_db_call() {
    let ctx = TestContext::new();
    let mut session = ctx.session();

    let user = session.create("User").unwrap();
    session.set(user, "name", "ghost").unwrap();
    session.persist(user).unwrap();
    session.remove(user).unwrap();

    let report = session.flush().unwrap();
    assert!(report.is_empty());
    assert_eq!(ctx.driver.row_count("user"), 0);
}

#[test]
fn native_operations_bypass_change_tracking() {
    let ctx = TestContext::new();
    let mut session = ctx.session();

    let pk = session
        .native_insert("User", &Row::new().with("name", "native"))
        .unwrap();
    assert_eq!(ctx.driver.row_count("user"), 1);

    let affected = session
        .native_update(
            "User",
            &Criteria::new().eq("id", pk.clone()),
            &[("name".to_string(), Value::String("renamed".into()))],
        )
        .unwrap();
    assert_eq!(affected, 1);

    let affected = session
        .native_delete("User", &Criteria::new().eq("id", pk))
        .unwrap();
    assert_eq!(affected, 1);
    assert_eq!(ctx.driver.row_count("user"), 0);

    // Nothing was tracked, so flush has nothing to do.
    assert!(session.flush().unwrap().is_empty());
    assert_eq!(session.identity_map_len(), 0);
}

#[test]
fn unique_constraint_violation_propagates_from_driver() {
    let ctx = TestContext::new();
    let generator = SchemaGenerator::new(
        Arc::clone(&ctx.registry),
        Arc::clone(&ctx.driver) as Arc<dyn Driver>,
        Box::new(GenericSqlPlatform),
    );
    generator.create_schema(true, false).unwrap();

    let mut session = ctx.session();
    let a = session.create("User").unwrap();
    session.set(a, "name", "a").unwrap();
    session.set(a, "email", "same@example.com").unwrap();
    session.persist(a).unwrap();
    session.flush().unwrap();

    let b = session.create("User").unwrap();
    session.set(b, "name", "b").unwrap();
    session.set(b, "email", "same@example.com").unwrap();
    session.persist(b).unwrap();

    assert!(matches!(session.flush(), Err(Error::Driver(_))));
    // The failed insert is not masked: the first row stays committed.
    assert_eq!(ctx.driver.row_count("user"), 1);
}

#[test]
fn clear_detaches_everything() {
    let ctx = TestContext::new();
    let mut session = ctx.session();

    let user = session.create("User").unwrap();
    session.set(user, "name", "a").unwrap();
    session.persist(user).unwrap();
    session.flush().unwrap();
    assert_eq!(session.identity_map_len(), 1);

    session.clear();
    assert_eq!(session.identity_map_len(), 0);
    assert!(matches!(session.state(user), Err(Error::StaleHandle)));
    assert!(matches!(session.get(user, "name"), Err(Error::StaleHandle)));
}

#[test]
fn schema_generation_backs_session_round_trip() {
    let ctx = TestContext::new();
    let generator = SchemaGenerator::new(
        Arc::clone(&ctx.registry),
        Arc::clone(&ctx.driver) as Arc<dyn Driver>,
        Box::new(GenericSqlPlatform),
    );

    let sql = generator.create_schema(true, false).unwrap();
    assert!(sql.contains("create table \"user\""));
    assert!(sql.contains("create table \"post\""));

    // The freshly created schema needs no further updates.
    assert!(generator.update_schema(true, false).unwrap().is_empty());

    let mut session = ctx.session();
    let user = session.create("User").unwrap();
    session.set(user, "name", "persisted").unwrap();
    session.persist(user).unwrap();
    session.flush().unwrap();
    assert_eq!(ctx.driver.row_count("user"), 1);
}

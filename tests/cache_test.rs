mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use common::{message_id, seed, user, EntryBuilder, HookCipher, IndexDir, TestCipher, POISON};
use nevermail_search::{BuildStart, CacheBudget, CacheStatus, Cipher, SearchCache};

const BIG: u64 = 1 << 30;

/// 256 bytes of bookkeeping + 4 byte id + body.
const ENTRY_1000: u64 = 256 + 4 + 1000;

#[tokio::test]
async fn build_is_idempotent() {
    let dir = IndexDir::new();
    let alice = user("alice");
    let handle = dir.open(&alice);
    let cipher = TestCipher::shared();
    seed(&handle, cipher.as_ref(), &dir.content_dir(&alice), 12, |t| format!("body {t}")).await;

    let cache = SearchCache::new(CacheBudget::new(BIG, 5));
    let view = cache.build_for(&alice, handle.clone(), cipher.clone()).await;
    assert!(view.is_built());
    assert!(!view.is_partial());
    assert_eq!(view.len(), 12);
    // 5 + 5 + 2, the short batch ends the build.
    assert_eq!(handle.batch_reads(), 3);

    let again = cache.start_build(alice.clone(), handle.clone(), cipher.clone()).await;
    assert_eq!(again, BuildStart::AlreadyBuilt);
    cache.build_for(&alice, handle.clone(), cipher).await;
    assert_eq!(handle.batch_reads(), 3);
    assert!(!handle.is_leased());
}

#[tokio::test]
async fn lookups_return_decrypted_bodies_newest_first() {
    let dir = IndexDir::new();
    let alice = user("alice");
    let handle = dir.open(&alice);
    let cipher = TestCipher::shared();
    seed(&handle, cipher.as_ref(), &dir.content_dir(&alice), 6, |t| format!("body {t}")).await;

    let cache = SearchCache::new(CacheBudget::new(BIG, 4));
    let view = cache.build_for(&alice, handle, cipher).await;

    assert_eq!(
        view.get(&message_id(3)).and_then(|m| m.body),
        Some("body 3".to_string())
    );
    let even: Vec<i64> = view.filter(|m| m.time % 2 == 0).iter().map(|m| m.time).collect();
    assert_eq!(even, vec![6, 4, 2]);
    assert_eq!(cache.last_cached_id(&alice), Some(message_id(1)));
    assert_eq!(cache.last_cached_time(&alice), Some(1));
    assert!(cache.size_bytes(&alice) > 0);
}

#[tokio::test]
async fn switching_users_discards_previous_working_set() {
    let dir = IndexDir::new();
    let (alice, bob) = (user("alice"), user("bob"));
    let cipher = TestCipher::shared();
    let alice_handle = dir.open(&alice);
    let bob_handle = dir.open(&bob);
    seed(&alice_handle, cipher.as_ref(), &dir.content_dir(&alice), 5, |t| format!("a{t}")).await;
    let bob_entry = EntryBuilder::new(100).body("b").build(cipher.as_ref(), &dir.content_dir(&bob));
    bob_handle.insert(bob_entry).await.unwrap();

    let cache = SearchCache::new(CacheBudget::new(BIG, 10));
    cache.build_for(&alice, alice_handle, cipher.clone()).await;
    assert_eq!(cache.len(&alice), 5);

    let view = cache.build_for(&bob, bob_handle, cipher).await;
    assert_eq!(view.len(), 1);
    assert_eq!(cache.current_user(), Some(bob.clone()));
    assert_eq!(cache.len(&alice), 0);
    assert!(!cache.is_built(&alice));
    assert!(!cache.contains(&alice, &message_id(1)));
    assert!(!cache.contains(&bob, &message_id(1)));
}

#[tokio::test]
async fn switching_cancels_in_flight_build() {
    let dir = IndexDir::new();
    let (alice, bob) = (user("alice"), user("bob"));
    let cipher = TestCipher::shared();
    let alice_handle = dir.open(&alice);
    let bob_handle = dir.open(&bob);
    seed(&alice_handle, cipher.as_ref(), &dir.content_dir(&alice), 200, |t| format!("a{t}")).await;
    seed(&bob_handle, cipher.as_ref(), &dir.content_dir(&bob), 3, |t| format!("b{t}")).await;

    let cache = SearchCache::new(CacheBudget::new(BIG, 1));
    let started = cache.start_build(alice.clone(), alice_handle.clone(), cipher.clone()).await;
    assert_eq!(started, BuildStart::Started);
    let coalesced = cache.start_build(alice.clone(), alice_handle.clone(), cipher.clone()).await;
    assert!(matches!(coalesced, BuildStart::Coalesced | BuildStart::AlreadyBuilt));

    let view = cache.build_for(&bob, bob_handle, cipher).await;
    assert!(view.is_built());
    assert_eq!(
        cache.status(),
        CacheStatus::Built { user_id: bob.clone(), partial: false }
    );
    let cached = view.filter(|_| true);
    assert_eq!(cached.len(), 3);
    assert!(cached.iter().all(|m| m.body.as_deref().is_some_and(|b| b.starts_with('b'))));
    assert!(!alice_handle.is_leased());
}

#[tokio::test]
async fn undecryptable_row_is_skipped_and_flagged() {
    let dir = IndexDir::new();
    let alice = user("alice");
    let handle = dir.open(&alice);
    let cipher = TestCipher::shared();
    seed(&handle, cipher.as_ref(), &dir.content_dir(&alice), 10, |t| {
        if t == 5 { format!("{POISON} {t}") } else { format!("body {t}") }
    })
    .await;

    let cache = SearchCache::new(CacheBudget::new(BIG, 4));
    let view = cache.build_for(&alice, handle.clone(), cipher.clone()).await;
    assert!(view.is_built());
    assert!(view.is_partial());
    assert_eq!(view.len(), 9);
    assert!(!view.contains(&message_id(5)));
    assert!(handle.get(&message_id(5)).await.unwrap().unwrap().decryption_failed);

    // The flag sticks: the next build caches the row's metadata only.
    cache.delete_for(&alice).await;
    let view = cache.build_for(&alice, handle, cipher).await;
    assert!(!view.is_partial());
    assert_eq!(view.len(), 10);
    assert_eq!(view.get(&message_id(5)).unwrap().body, None);
}

#[tokio::test]
async fn failing_batch_stops_build_as_partial() {
    let dir = IndexDir::new();
    let alice = user("alice");
    let handle = dir.open(&alice);
    let cipher = TestCipher::shared();
    // Newest first in batches of 5: the 10th batch holds times 15..=11.
    seed(&handle, cipher.as_ref(), &dir.content_dir(&alice), 60, |t| {
        if (11..=15).contains(&t) { format!("{POISON} {t}") } else { format!("body {t}") }
    })
    .await;

    let cache = SearchCache::new(CacheBudget::new(BIG, 5));
    let view = cache.build_for(&alice, handle.clone(), cipher).await;

    assert!(view.is_built());
    assert!(view.is_partial());
    assert_eq!(view.len(), 45);
    assert!(view.contains(&message_id(16)));
    assert!(!view.contains(&message_id(10)));
    assert_eq!(handle.batch_reads(), 10);
}

#[tokio::test]
async fn byte_budget_stops_build_as_partial() {
    let dir = IndexDir::new();
    let alice = user("alice");
    let handle = dir.open(&alice);
    let cipher = TestCipher::shared();
    seed(&handle, cipher.as_ref(), &dir.content_dir(&alice), 10, |_| "x".repeat(1000)).await;

    let cache = SearchCache::new(CacheBudget::new(5000, 2));
    let view = cache.build_for(&alice, handle, cipher).await;

    assert!(view.is_partial());
    assert_eq!(view.len(), 3);
    assert_eq!(cache.size_bytes(&alice), 3 * ENTRY_1000);
    for time in [10, 9, 8] {
        assert!(view.contains(&message_id(time)));
    }
}

#[tokio::test]
async fn delete_for_other_user_is_noop() {
    let dir = IndexDir::new();
    let (alice, bob) = (user("alice"), user("bob"));
    let handle = dir.open(&alice);
    let cipher = TestCipher::shared();
    seed(&handle, cipher.as_ref(), &dir.content_dir(&alice), 3, |t| format!("body {t}")).await;

    let cache = SearchCache::new(CacheBudget::new(BIG, 10));
    cache.build_for(&alice, handle, cipher).await;

    assert!(!cache.delete_for(&bob).await);
    assert!(cache.is_built(&alice));

    assert!(cache.delete_for(&alice).await);
    assert_eq!(cache.status(), CacheStatus::Unbuilt);
    assert_eq!(cache.current_user(), None);
    assert_eq!(cache.len(&alice), 0);
}

#[tokio::test]
async fn subscribers_see_build_complete() {
    let dir = IndexDir::new();
    let alice = user("alice");
    let handle = dir.open(&alice);
    let cipher = TestCipher::shared();
    seed(&handle, cipher.as_ref(), &dir.content_dir(&alice), 7, |t| format!("body {t}")).await;

    let cache = SearchCache::new(CacheBudget::new(BIG, 3));
    let mut rx = cache.subscribe();
    cache.start_build(alice.clone(), handle, cipher).await;

    let status = rx
        .wait_for(|s| matches!(s, CacheStatus::Built { .. }))
        .await
        .unwrap()
        .clone();
    assert_eq!(status, CacheStatus::Built { user_id: alice.clone(), partial: false });
    assert_eq!(cache.len(&alice), 7);
}

#[tokio::test]
async fn single_entries_can_be_refreshed_and_invalidated() {
    let dir = IndexDir::new();
    let alice = user("alice");
    let handle = dir.open(&alice);
    let cipher = TestCipher::shared();
    seed(&handle, cipher.as_ref(), &dir.content_dir(&alice), 3, |t| format!("body {t}")).await;

    let cache = SearchCache::new(CacheBudget::new(BIG, 10));
    cache.build_for(&alice, handle, cipher.clone()).await;

    let fresh = EntryBuilder::new(2)
        .body("edited")
        .build(cipher.as_ref(), &dir.content_dir(&alice));
    assert!(cache.update_entry(&alice, &fresh, cipher.as_ref()));
    assert_eq!(cache.len(&alice), 3);
    assert_eq!(cache.get(&alice, &message_id(2)).unwrap().body.as_deref(), Some("edited"));

    let new = EntryBuilder::new(4).body("new").build(cipher.as_ref(), &dir.content_dir(&alice));
    assert!(cache.update_entry(&alice, &new, cipher.as_ref()));
    assert_eq!(cache.len(&alice), 4);
    assert!(!cache.update_entry(&user("bob"), &new, cipher.as_ref()));

    assert!(cache.invalidate_entry(&alice, &message_id(1)));
    assert!(!cache.invalidate_entry(&alice, &message_id(1)));
    assert!(!cache.contains(&alice, &message_id(1)));
    assert_eq!(cache.last_cached_time(&alice), Some(2));
}

#[tokio::test]
async fn trim_evicts_oldest_entries() {
    let dir = IndexDir::new();
    let alice = user("alice");
    let handle = dir.open(&alice);
    let cipher = TestCipher::shared();
    seed(&handle, cipher.as_ref(), &dir.content_dir(&alice), 10, |_| "x".repeat(1000)).await;

    let cache = SearchCache::new(CacheBudget::new(BIG, 10));
    cache.build_for(&alice, handle, cipher).await;
    assert_eq!(cache.size_bytes(&alice), 10 * ENTRY_1000);

    assert_eq!(cache.trim_to(3 * ENTRY_1000), 7);
    assert_eq!(cache.len(&alice), 3);
    assert!(cache.is_partial(&alice));
    assert_eq!(cache.last_cached_time(&alice), Some(8));
    assert_eq!(cache.trim_to(3 * ENTRY_1000), 0);
}

#[tokio::test]
async fn trim_during_build_keeps_cache_partial() {
    let dir = IndexDir::new();
    let alice = user("alice");
    let handle = dir.open(&alice);
    let cache = SearchCache::new(CacheBudget::new(BIG, 3));

    let evicted = Arc::new(AtomicUsize::new(0));
    let cipher: Arc<dyn Cipher> = {
        let (cache, evicted) = (cache.clone(), Arc::clone(&evicted));
        Arc::new(HookCipher::new("trim now", move || {
            evicted.fetch_add(cache.trim_to(0), Ordering::SeqCst);
        }))
    };
    // Batches of 3: 10..=8 are cached before the trim fires inside 7..=5.
    seed(&handle, cipher.as_ref(), &dir.content_dir(&alice), 10, |t| {
        if t == 5 { "trim now".to_string() } else { format!("body {t}") }
    })
    .await;

    let view = cache.build_for(&alice, handle.clone(), cipher).await;
    assert_eq!(evicted.load(Ordering::SeqCst), 3);
    assert!(view.is_built());
    assert!(view.is_partial());
    assert!(view.is_empty());
    assert_eq!(
        cache.status(),
        CacheStatus::Built { user_id: alice.clone(), partial: true }
    );

    // A rebuild starts from the full budget again.
    cache.delete_for(&alice).await;
    let view = cache.build_for(&alice, handle, TestCipher::shared()).await;
    assert_eq!(view.len(), 10);
    assert!(!view.is_partial());
}

#[tokio::test]
async fn oversized_update_during_build_keeps_cache_partial() {
    let dir = IndexDir::new();
    let alice = user("alice");
    let handle = dir.open(&alice);
    let content_dir = dir.content_dir(&alice);
    let cache = SearchCache::new(CacheBudget::new(20_000, 4));

    let huge = EntryBuilder::new(100)
        .body("h".repeat(30_000))
        .build(&TestCipher::new(), &content_dir);
    let refused = Arc::new(AtomicBool::new(false));
    let cipher: Arc<dyn Cipher> = {
        let (cache, refused, alice) = (cache.clone(), Arc::clone(&refused), alice.clone());
        Arc::new(HookCipher::new("grow", move || {
            let stored = cache.update_entry(&alice, &huge, &TestCipher::new());
            refused.store(!stored, Ordering::SeqCst);
        }))
    };
    seed(&handle, cipher.as_ref(), &content_dir, 10, |t| {
        if t == 8 { "grow".to_string() } else { format!("body {t}") }
    })
    .await;

    let view = cache.build_for(&alice, handle, cipher).await;
    assert!(refused.load(Ordering::SeqCst));
    assert_eq!(view.len(), 10);
    assert!(!view.contains(&message_id(100)));
    assert!(view.is_partial());
}

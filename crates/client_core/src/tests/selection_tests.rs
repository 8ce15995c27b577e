use std::sync::atomic::AtomicU32;

use async_trait::async_trait;
use shared::protocol::{Page, Pagination};

use super::*;

fn contact(id: &str, name: &str, email: &str) -> Contact {
    Contact {
        id: ContactId::from(id),
        company: "Acme".to_owned(),
        full_name: name.to_owned(),
        email: email.to_owned(),
        work_phone: None,
        mobile_phone: None,
        role: None,
        address: None,
        city: None,
        state: None,
        zip: None,
        unsubscribed: false,
        created_at: None,
    }
}

struct TestDirectory {
    contacts: Vec<Contact>,
    /// Server-enforced cap on the page size, regardless of the requested
    /// limit.
    served_limit: Option<u32>,
    fail_on_page: Option<u32>,
    delay: Option<Duration>,
    list_calls: AtomicU32,
}

impl TestDirectory {
    fn new(contacts: Vec<Contact>) -> Self {
        Self {
            contacts,
            served_limit: None,
            fail_on_page: None,
            delay: None,
            list_calls: AtomicU32::new(0),
        }
    }

    fn numbered(count: usize) -> Self {
        let contacts = (1..=count)
            .map(|n| contact(&format!("c{n}"), &format!("Contact {n}"), &format!("c{n}@example.com")))
            .collect();
        Self::new(contacts)
    }

    fn with_served_limit(mut self, limit: u32) -> Self {
        self.served_limit = Some(limit);
        self
    }

    fn failing_on_page(mut self, page: u32) -> Self {
        self.fail_on_page = Some(page);
        self
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn list_calls(&self) -> u32 {
        self.list_calls.load(Ordering::SeqCst)
    }

    fn matching(&self, search: Option<&str>) -> Vec<Contact> {
        let Some(term) = search else {
            return self.contacts.clone();
        };
        let term = term.to_lowercase();
        self.contacts
            .iter()
            .filter(|c| {
                c.full_name.to_lowercase().contains(&term)
                    || c.email.to_lowercase().contains(&term)
                    || c.company.to_lowercase().contains(&term)
            })
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ContactDirectory for TestDirectory {
    async fn list(&self, page: u32, limit: u32, search: Option<&str>) -> Result<Page<Contact>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_on_page == Some(page) {
            return Err(ClientError::Api {
                status: 500,
                message: "directory exploded".to_owned(),
            });
        }

        let limit = self.served_limit.map_or(limit, |cap| limit.min(cap)).max(1);
        let matching = self.matching(search);
        let total_items = matching.len() as u64;
        let total_pages = total_items.div_ceil(u64::from(limit)) as u32;
        let start = ((page.max(1) - 1) * limit) as usize;
        let items: Vec<Contact> = matching.into_iter().skip(start).take(limit as usize).collect();

        Ok(Page {
            items,
            pagination: Pagination {
                page,
                total_pages,
                total_items,
            },
        })
    }

    async fn list_by_ids(&self, ids: &[ContactId]) -> Result<Vec<Contact>> {
        Ok(self
            .contacts
            .iter()
            .filter(|c| ids.contains(&c.id))
            .cloned()
            .collect())
    }

    async fn list_unsubscribed(
        &self,
        page: u32,
        _limit: u32,
        _search: Option<&str>,
    ) -> Result<Page<Contact>> {
        let items: Vec<Contact> = self
            .contacts
            .iter()
            .filter(|c| c.unsubscribed)
            .cloned()
            .collect();
        let total_items = items.len() as u64;
        Ok(Page {
            items,
            pagination: Pagination {
                page,
                total_pages: 1,
                total_items,
            },
        })
    }
}

#[tokio::test]
async fn toggle_is_idempotent_set_membership() {
    let selection = RecipientSelection::new(Arc::new(TestDirectory::numbered(3)));

    selection.toggle(ContactId::from("c1"), true).await;
    selection.toggle(ContactId::from("c1"), true).await;
    selection.toggle(ContactId::from("c2"), true).await;
    selection.toggle(ContactId::from("c1"), false).await;
    selection.toggle(ContactId::from(""), true).await;

    let ids = selection.selected_ids().await;
    assert_eq!(ids, vec![ContactId::from("c2")]);
}

#[tokio::test]
async fn select_page_round_trips_on_same_page() {
    let selection = RecipientSelection::new(Arc::new(TestDirectory::numbered(12)));
    selection.refresh().await.expect("refresh");

    // An id from page 2, selected manually before touching page 1.
    selection.toggle(ContactId::from("c11"), true).await;

    selection.select_page(true).await;
    assert_eq!(selection.selected_count().await, 11);

    selection.select_page(false).await;
    let ids = selection.selected_ids().await;
    assert_eq!(ids, vec![ContactId::from("c11")]);
}

#[tokio::test]
async fn select_all_matching_walks_every_page_once() {
    let directory = Arc::new(TestDirectory::numbered(25).with_served_limit(10));
    let selection = RecipientSelection::new(directory.clone());

    let applied = selection.select_all_matching(true).await.expect("select all");
    assert!(applied);
    assert_eq!(selection.selected_count().await, 25);
    assert_eq!(directory.list_calls(), 3);
}

#[tokio::test]
async fn fetch_all_failure_preserves_prior_selection() {
    let directory = Arc::new(
        TestDirectory::numbered(25)
            .with_served_limit(10)
            .failing_on_page(2),
    );
    let selection = RecipientSelection::new(directory.clone());

    selection.toggle(ContactId::from("c1"), true).await;
    selection.toggle(ContactId::from("c2"), true).await;

    let result = selection.select_all_matching(true).await;
    assert!(result.is_err());

    let mut ids = selection.selected_ids().await;
    ids.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(ids, vec![ContactId::from("c1"), ContactId::from("c2")]);
}

#[tokio::test]
async fn unchecking_select_all_clears_everything() {
    let selection = RecipientSelection::new(Arc::new(TestDirectory::numbered(5)));
    selection.select_all_matching(true).await.expect("select all");
    assert_eq!(selection.selected_count().await, 5);

    selection.select_all_matching(false).await.expect("clear");
    assert_eq!(selection.selected_count().await, 0);
}

#[tokio::test]
async fn search_keeps_cross_query_selection() {
    let directory = Arc::new(TestDirectory::new(vec![
        contact("a1", "Alice One", "alice1@example.com"),
        contact("a2", "Alice Two", "alice2@example.com"),
        contact("b1", "Bob One", "bob1@example.com"),
    ]));
    let selection = RecipientSelection::new(directory);

    selection.search("alice").await.expect("search alice");
    selection.select_page(true).await;
    assert_eq!(selection.selected_count().await, 2);

    selection.search("bob").await.expect("search bob");
    let window = selection.window().await;
    assert_eq!(window.items.len(), 1);
    assert_eq!(window.page, 1);

    // Ids selected under the previous query are not pruned.
    assert!(selection.is_selected(&ContactId::from("a1")).await);
    assert!(selection.is_selected(&ContactId::from("a2")).await);
}

#[tokio::test]
async fn paging_accumulates_to_full_directory() {
    let directory = Arc::new(TestDirectory::numbered(12));
    let selection = RecipientSelection::new(directory.clone());

    selection.refresh().await.expect("page 1");
    selection.select_page(true).await;
    selection.change_page(2).await.expect("page 2");
    selection.select_page(true).await;

    assert_eq!(selection.selected_count().await, 12);

    let recipients = selection.recipients().await.expect("recipients");
    assert_eq!(recipients.len(), 12);
}

#[tokio::test]
async fn select_all_mode_is_derived_from_membership() {
    let selection = RecipientSelection::new(Arc::new(TestDirectory::numbered(12)));
    selection.refresh().await.expect("refresh");
    assert_eq!(selection.select_all_mode().await, SelectAllMode::None);

    selection.select_page(true).await;
    assert_eq!(selection.select_all_mode().await, SelectAllMode::Page);

    selection.select_all_matching(true).await.expect("select all");
    assert_eq!(selection.select_all_mode().await, SelectAllMode::AllQuery);

    selection.toggle(ContactId::from("c1"), false).await;
    assert_eq!(selection.select_all_mode().await, SelectAllMode::None);
}

#[tokio::test]
async fn window_error_degrades_to_empty_but_keeps_selection() {
    let selection =
        RecipientSelection::new(Arc::new(TestDirectory::numbered(5).failing_on_page(1)));
    selection.toggle(ContactId::from("c1"), true).await;

    let result = selection.refresh().await;
    assert!(result.is_err());

    let window = selection.window().await;
    assert!(window.items.is_empty());
    assert_eq!(window.total_items, 0);
    assert_eq!(selection.selected_count().await, 1);
}

#[tokio::test]
async fn cancelled_fetch_all_preserves_selection() {
    let directory = Arc::new(
        TestDirectory::numbered(50)
            .with_served_limit(10)
            .with_delay(Duration::from_millis(25)),
    );
    let selection = RecipientSelection::new(directory);
    selection.toggle(ContactId::from("c1"), true).await;

    let task = {
        let selection = Arc::clone(&selection);
        tokio::spawn(async move { selection.select_all_matching(true).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    selection.cancel_select_all();

    let applied = task.await.expect("join").expect("select all");
    assert!(!applied);
    let ids = selection.selected_ids().await;
    assert_eq!(ids, vec![ContactId::from("c1")]);
}

#[tokio::test]
async fn debounced_search_coalesces_keystrokes() {
    let directory = Arc::new(TestDirectory::numbered(5));
    let selection = RecipientSelection::new(directory.clone());

    selection.debounced_search("c");
    selection.debounced_search("c1");
    tokio::time::sleep(SEARCH_DEBOUNCE + Duration::from_millis(100)).await;

    assert_eq!(directory.list_calls(), 1);
    let window = selection.window().await;
    assert_eq!(window.search.as_deref(), Some("c1"));
}

#[tokio::test]
async fn recipients_drop_unsubscribed_and_duplicate_emails() {
    let mut gone = contact("u1", "Gone Away", "gone@example.com");
    gone.unsubscribed = true;
    let twin_a = contact("t1", "Twin A", "twin@example.com");
    let twin_b = contact("t2", "Twin B", "TWIN@example.com");

    let selection =
        RecipientSelection::new(Arc::new(TestDirectory::new(vec![gone, twin_a, twin_b])));
    selection.toggle(ContactId::from("u1"), true).await;
    selection.toggle(ContactId::from("t1"), true).await;
    selection.toggle(ContactId::from("t2"), true).await;

    let recipients = selection.recipients().await.expect("recipients");
    assert_eq!(recipients.len(), 1);
    assert_eq!(recipients[0].email.to_lowercase(), "twin@example.com");
}

#[tokio::test]
async fn stale_page_response_is_dropped() {
    let directory = Arc::new(TestDirectory::numbered(30).with_delay(Duration::from_millis(40)));
    let selection = RecipientSelection::new(directory.clone());

    let slow = {
        let selection = Arc::clone(&selection);
        tokio::spawn(async move { selection.change_page(1).await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    // A newer navigation bumps the generation; the slow page-1 response
    // must not overwrite it once it lands.
    selection.change_page(3).await.expect("page 3");
    slow.await.expect("join").expect("stale fetch");

    let window = selection.window().await;
    assert_eq!(window.page, 3);
}

use bean_cache::{
    Bean, BeanFactory, BeanFactoryRegistry, BeanLifecycle, BeanRef, Cached, Cardinality,
    ConstructorProperty, Criterion, CriterionGroup, CriterionOperator, DataLevel, DataType,
    ForeignKeyProperty, IndexDef, Key, MapEvent, MapEventKind, MapListener, MemoryDataSource,
    MemoryTabularData, NotificationBatch, Parameter, Property, ReferenceType, RowKind, Schema,
    SchemaRegistry, SubClassMapping, SubClassOperator, TabularBeanFactoryType, Value,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const TRADE_COLUMNS: [&str; 5] = ["TRADE_ID", "BOOK_ID", "CCY", "QUANTITY", "REFERENCE"];

// A small trading desk: reference data, books, trades, an instrument
// hierarchy and a self-referencing employee table
struct Desk {
    source: Arc<MemoryDataSource>,
    registry: Arc<BeanFactoryRegistry>,
}

impl Desk {
    fn new() -> Self {
        Self::with_lifecycle(None)
    }

    fn with_lifecycle(lifecycle: Option<Arc<dyn BeanLifecycle>>) -> Self {
        let source = Arc::new(MemoryDataSource::new());
        seed(&source);

        let mut schemas = schemas();
        if let Some(lifecycle) = lifecycle {
            schemas = schemas.lifecycle("Trade", lifecycle);
        }
        let registry = BeanFactoryRegistry::builder(schemas.build().unwrap())
            .factory_type(Arc::new(
                TabularBeanFactoryType::new().with_source("default", source.clone()),
            ))
            .build();
        Self { source, registry }
    }

    fn factory(&self, type_name: &str) -> Arc<BeanFactory> {
        self.registry.get_instance(type_name, None).unwrap()
    }

    fn notify(&self, type_name: &str, data: MemoryTabularData) -> Vec<BeanRef> {
        self.registry
            .process_notifications(vec![NotificationBatch::new(type_name, Box::new(data))])
            .unwrap()
    }
}

fn seed(source: &MemoryDataSource) {
    source.table("Currency", ["CODE", "NAME"]);
    source.insert("Currency", vec!["GBP".into(), "Sterling".into()]);
    source.insert("Currency", vec!["EUR".into(), "Euro".into()]);

    source.table("Book", ["BOOK_ID", "NAME"]);
    source.insert("Book", vec![1.into(), "Rates".into()]);
    source.insert("Book", vec![2.into(), "Credit".into()]);

    source.table("Trade", TRADE_COLUMNS);
    source.insert("Trade", vec![1.into(), 1.into(), "GBP".into(), 500.into(), "T-1".into()]);
    source.insert("Trade", vec![2.into(), 1.into(), "EUR".into(), 50.into(), "T-2".into()]);
    source.insert("Trade", vec![3.into(), 2.into(), "GBP".into(), 75.into(), "T-3".into()]);

    source.table("Instrument", ["INSTRUMENT_ID", "INSTRUMENT_TYPE", "CODE"]);
    source.insert("Instrument", vec![1.into(), "BOND".into(), "XS1".into()]);
    source.insert("Instrument", vec![2.into(), "EQUITY".into(), "GB2".into()]);

    source.table("Bond", ["INSTRUMENT_ID", "INSTRUMENT_TYPE", "CODE", "COUPON"]);
    source.insert("Bond", vec![1.into(), "BOND".into(), "XS1".into(), 4.5.into()]);

    source.table("Employee", ["EMPLOYEE_ID", "NAME", "MANAGER_ID"]);
    source.insert("Employee", vec![1.into(), "Ada".into(), 2.into()]);
    source.insert("Employee", vec![2.into(), "Grace".into(), 1.into()]);

    source.table("Team", ["TEAM_ID", "NAME", "LEAD_ID"]);
    source.table("Player", ["PLAYER_ID", "NAME", "TEAM_ID"]);

    source.table("Quote", ["QUOTE_ID", "PRICE"]);
    source.insert("Quote", vec![1.into(), 101.5.into()]);
    source.insert("Quote", vec![2.into(), 99.0.into()]);
}

fn foreign_key(
    name: &str,
    type_name: &str,
    cardinality: Cardinality,
    index: Option<&str>,
    column: &str,
    lazy: bool,
) -> Property {
    Property::ForeignKey(ForeignKeyProperty {
        name: name.to_string(),
        type_name: type_name.to_string(),
        cardinality,
        foreign_index: index.map(str::to_string),
        parameters: vec![Parameter::column(column)],
        lazy,
    })
}

fn schemas() -> bean_cache::SchemaRegistryBuilder {
    SchemaRegistry::builder()
        .constructor("tradeLabel", |args: &[Value]| {
            let reference = args[0].to_text().unwrap_or_default();
            let quantity = args[1].to_text().unwrap_or_default();
            Ok(Value::from(format!("{} x{}", reference, quantity)))
        })
        .schema(
            Schema::new("Currency")
                .with_primary_key(&["CODE"])
                .with_column("code", "CODE", DataType::String)
                .with_column("name", "NAME", DataType::String)
                .with_levels(DataLevel::Low, DataLevel::Low)
                .with_factory_type("tabular"),
        )
        .schema(
            Schema::new("Book")
                .with_primary_key(&["BOOK_ID"])
                .with_column("bookId", "BOOK_ID", DataType::Integer)
                .with_column("name", "NAME", DataType::String)
                .with_property(foreign_key(
                    "trades",
                    "Trade",
                    Cardinality::Many,
                    Some("byBook"),
                    "BOOK_ID",
                    true,
                ))
                .with_factory_type("tabular"),
        )
        .schema(
            Schema::new("Trade")
                .with_primary_key(&["TRADE_ID"])
                .with_column("tradeId", "TRADE_ID", DataType::Integer)
                .with_column("bookId", "BOOK_ID", DataType::Integer)
                .with_column("quantity", "QUANTITY", DataType::Integer)
                .with_column("reference", "REFERENCE", DataType::String)
                .with_property(foreign_key(
                    "book",
                    "Book",
                    Cardinality::One,
                    None,
                    "BOOK_ID",
                    false,
                ))
                .with_property(foreign_key(
                    "currency",
                    "Currency",
                    Cardinality::One,
                    None,
                    "CCY",
                    false,
                ))
                .with_property(Property::Constructor(ConstructorProperty {
                    name: "label".to_string(),
                    type_name: "String".to_string(),
                    constructor: "tradeLabel".to_string(),
                    parameters: vec![
                        Parameter::property("reference"),
                        Parameter::column("QUANTITY"),
                    ],
                    lazy: true,
                }))
                .with_index(IndexDef::new("byBook", false, &["BOOK_ID"]))
                .with_index(IndexDef::new("byReference", true, &["REFERENCE"]))
                .with_factory_type("tabular"),
        )
        .schema(
            Schema::new("Instrument")
                .with_primary_key(&["INSTRUMENT_ID"])
                .with_column("instrumentId", "INSTRUMENT_ID", DataType::Integer)
                .with_column("type", "INSTRUMENT_TYPE", DataType::String)
                .with_column("code", "CODE", DataType::String)
                .with_index(IndexDef::new("byCode", true, &["CODE"]))
                .with_sub_class_mapping(
                    SubClassMapping::new("Bond").when(
                        "INSTRUMENT_TYPE",
                        SubClassOperator::Eq,
                        &["BOND"],
                    ),
                )
                .with_factory_type("tabular"),
        )
        .schema(
            Schema::new("Bond")
                .with_super_type("Instrument")
                .with_column("coupon", "COUPON", DataType::Number)
                .with_factory_type("tabular"),
        )
        .schema(
            Schema::new("Employee")
                .with_primary_key(&["EMPLOYEE_ID"])
                .with_column("employeeId", "EMPLOYEE_ID", DataType::Integer)
                .with_column("name", "NAME", DataType::String)
                .with_property(foreign_key(
                    "manager",
                    "Employee",
                    Cardinality::One,
                    None,
                    "MANAGER_ID",
                    false,
                ))
                .with_levels(DataLevel::High, DataLevel::Low)
                .with_factory_type("tabular"),
        )
        .schema(
            Schema::new("Team")
                .with_primary_key(&["TEAM_ID"])
                .with_column("teamId", "TEAM_ID", DataType::Integer)
                .with_column("name", "NAME", DataType::String)
                .with_property(foreign_key(
                    "lead",
                    "Player",
                    Cardinality::One,
                    None,
                    "LEAD_ID",
                    false,
                ))
                .with_factory_type("tabular"),
        )
        .schema(
            Schema::new("Player")
                .with_primary_key(&["PLAYER_ID"])
                .with_column("playerId", "PLAYER_ID", DataType::Integer)
                .with_column("name", "NAME", DataType::String)
                .with_property(foreign_key(
                    "team",
                    "Team",
                    Cardinality::One,
                    None,
                    "TEAM_ID",
                    false,
                ))
                .with_factory_type("tabular"),
        )
        .schema(
            Schema::new("Quote")
                .with_primary_key(&["QUOTE_ID"])
                .with_column("quoteId", "QUOTE_ID", DataType::Integer)
                .with_column("price", "PRICE", DataType::Number)
                .with_reference_type(ReferenceType::Weak)
                .with_factory_type("tabular"),
        )
}

#[derive(Default)]
struct Recorder {
    kinds: Mutex<Vec<MapEventKind>>,
}

impl Recorder {
    fn take(&self) -> Vec<MapEventKind> {
        std::mem::take(&mut *self.kinds.lock())
    }
}

impl MapListener for Recorder {
    fn map_changed(&self, event: &MapEvent) -> anyhow::Result<()> {
        self.kinds.lock().push(event.kind);
        Ok(())
    }
}

/// Events from several factories, in firing order
#[derive(Default)]
struct Journal {
    entries: Mutex<Vec<(String, MapEventKind)>>,
}

impl Journal {
    fn take(&self) -> Vec<(String, MapEventKind)> {
        std::mem::take(&mut *self.entries.lock())
    }
}

impl MapListener for Journal {
    fn map_changed(&self, event: &MapEvent) -> anyhow::Result<()> {
        self.entries
            .lock()
            .push((event.source.type_name.clone(), event.kind));
        Ok(())
    }
}

#[derive(Default)]
struct CountingLifecycle {
    init: AtomicUsize,
    inserted: AtomicUsize,
    updated: AtomicUsize,
    deleted: AtomicUsize,
}

impl BeanLifecycle for CountingLifecycle {
    fn init(&self, _bean: &BeanRef) -> anyhow::Result<()> {
        self.init.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn inserted(&self, _bean: &BeanRef) -> anyhow::Result<()> {
        self.inserted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn updated(&self, _bean: &BeanRef) -> anyhow::Result<()> {
        self.updated.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn deleted(&self, _bean: &BeanRef) -> anyhow::Result<()> {
        self.deleted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn trade_row(id: i32, book: i32, ccy: &str, quantity: i32) -> Vec<Value> {
    vec![id.into(), book.into(), ccy.into(), quantity.into(), format!("T-{}", id).into()]
}

#[test]
fn test_load_resolves_foreign_keys() {
    let desk = Desk::new();
    let trades = desk.factory("Trade");

    let trade = trades.get_bean(&Key::from(1)).unwrap().unwrap();
    assert_eq!(trade.get("quantity"), Value::Int(500));
    let book = trade.get("book").as_bean().cloned().unwrap();
    assert_eq!(book.get("name"), Value::from("Rates"));
    let currency = trade.get("currency").as_bean().cloned().unwrap();
    assert_eq!(currency.get("name"), Value::from("Sterling"));

    // The book and currency now come from their own caches
    let books = desk.factory("Book");
    assert!(Arc::ptr_eq(&books.get_bean(&Key::from(1)).unwrap().unwrap(), &book));
    println!("✓ trade 1 resolved to book {} in {}", book, currency);
}

#[test]
fn test_lazy_to_many_property() {
    let desk = Desk::new();
    let books = desk.factory("Book");
    let book = books.get_bean(&Key::from(1)).unwrap().unwrap();
    assert!(matches!(book.get_raw("tradesCollection"), Value::Lazy(_)));

    let trades = book.get("tradesCollection");
    let trades = trades.as_collection().unwrap();
    assert_eq!(trades.len(), 2);
    for trade in trades.to_vec() {
        assert_eq!(trade.get("bookId"), Value::Int(1));
        assert!(Arc::ptr_eq(&trade.get("book").as_bean().cloned().unwrap(), &book));
    }
    println!("✓ book 1 lazily loaded {} trades", trades.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_loads_share_one_bean() {
    let desk = Desk::new();
    desk.source.set_latency(Some(Duration::from_millis(20)));
    let books = desk.factory("Book");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let books = books.clone();
        handles.push(tokio::task::spawn_blocking(move || {
            books.get_bean(&Key::from(1)).unwrap().unwrap()
        }));
    }
    let mut beans = Vec::new();
    for handle in handles {
        beans.push(handle.await.unwrap());
    }

    for bean in &beans {
        assert!(Arc::ptr_eq(bean, &beans[0]));
    }
    assert_eq!(books.len(), 1);
    println!("✓ {} concurrent loads returned one bean", beans.len());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_loads_of_static_type() {
    let desk = Desk::new();
    desk.source.set_latency(Some(Duration::from_millis(200)));
    let currencies = desk.factory("Currency");

    let first = {
        let currencies = currencies.clone();
        tokio::task::spawn_blocking(move || currencies.get(&Key::from("GBP"), None).unwrap())
    };
    // Miss while the first load's select is still running
    tokio::time::sleep(Duration::from_millis(50)).await;
    let second = {
        let currencies = currencies.clone();
        tokio::task::spawn_blocking(move || currencies.get(&Key::from("GBP"), None).unwrap())
    };

    let first = first.await.unwrap();
    let second = second.await.unwrap();
    assert!(!first.is_null());
    assert!(!second.is_null(), "second get found nothing for an existing key");
    assert!(Arc::ptr_eq(first.as_bean().unwrap(), second.as_bean().unwrap()));
    assert_eq!(desk.source.select_count(), 1);
    assert_eq!(currencies.len(), 2);
    println!("✓ concurrent gets of {} shared one select", second.as_bean().unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reader_waits_for_partial_inflation() {
    let desk = Desk::new();
    desk.source.set_latency(Some(Duration::from_millis(100)));
    let trades = desk.factory("Trade");

    let loader = {
        let trades = trades.clone();
        tokio::task::spawn_blocking(move || trades.get_bean(&Key::from(1)).unwrap().unwrap())
    };
    // Arrive while the first load is resolving the trade's book
    tokio::time::sleep(Duration::from_millis(150)).await;
    let reader = {
        let trades = trades.clone();
        tokio::task::spawn_blocking(move || {
            let trade = trades.get_bean(&Key::from(1)).unwrap().unwrap();
            let book = trade.get_raw("book");
            (trade, book)
        })
    };

    let loaded = loader.await.unwrap();
    let (read, book) = reader.await.unwrap();
    assert!(Arc::ptr_eq(&loaded, &read));
    assert!(book.as_bean().is_some(), "reader saw a partially inflated trade");
    assert!(desk.registry.inflation().is_empty());
    println!("✓ reader saw a fully inflated trade");
}

#[test]
fn test_missing_key_is_cached_as_null() {
    let desk = Desk::new();
    let books = desk.factory("Book");

    assert!(books.get(&Key::from(42), None).unwrap().is_null());
    let selects = desk.source.select_count();
    assert!(books.get(&Key::from(42), None).unwrap().is_null());
    assert_eq!(desk.source.select_count(), selects);
    assert!(books.contains_key(&Key::from(42), None));
}

#[test]
fn test_put_does_not_replace_cached_bean() {
    let desk = Desk::new();
    let books = desk.factory("Book");
    let original = books.get_bean(&Key::from(1)).unwrap().unwrap();

    let impostor = Bean::new("Book");
    impostor.set("bookId", 1);
    books.put(Key::from(1), Cached::Bean(impostor)).unwrap();
    assert!(Arc::ptr_eq(&books.get_bean(&Key::from(1)).unwrap().unwrap(), &original));

    // A cached null is replaced by a real value
    assert!(books.get(&Key::from(42), None).unwrap().is_null());
    let late = Bean::new("Book");
    late.set("bookId", 42);
    books.put(Key::from(42), Cached::Bean(late.clone())).unwrap();
    assert!(Arc::ptr_eq(&books.get_bean(&Key::from(42)).unwrap().unwrap(), &late));

    let derived = Bean::new("Book");
    derived.set("bookId", 7);
    books.put_value(derived.clone()).unwrap();
    assert!(Arc::ptr_eq(&books.get_bean(&Key::from(7)).unwrap().unwrap(), &derived));

    // Beans of another type are refused
    let stranger = Bean::new("Trade");
    assert!(books.put(Key::from(8), Cached::Bean(stranger)).is_err());
}

#[test]
fn test_sub_type_load_propagates_to_super_type() {
    let desk = Desk::new();
    let instruments = desk.factory("Instrument");
    let bonds = desk.factory("Bond");
    assert!(instruments.shares_lock_with(&bonds));

    let bond = instruments.get_bean(&Key::from(1)).unwrap().unwrap();
    assert_eq!(bond.type_name(), "Bond");
    assert_eq!(bond.get("coupon"), Value::Float(4.5));
    assert!(Arc::ptr_eq(&bonds.get_bean(&Key::from(1)).unwrap().unwrap(), &bond));

    let selects = desk.source.select_count();
    let by_code = instruments.get(&Key::from("XS1"), Some("byCode")).unwrap();
    assert!(Arc::ptr_eq(by_code.as_bean().unwrap(), &bond));
    assert_eq!(desk.source.select_count(), selects);

    let equity = instruments.get_bean(&Key::from(2)).unwrap().unwrap();
    assert_eq!(equity.type_name(), "Instrument");
    assert!(!bonds.contains_key(&Key::from(2), None));
    println!("✓ bond 1 visible through Instrument and Bond");
}

#[test]
fn test_put_into_sub_type_reaches_super_type() {
    let desk = Desk::new();
    let instruments = desk.factory("Instrument");
    let bonds = desk.factory("Bond");
    let journal = Arc::new(Journal::default());
    instruments.add_map_listener(journal.clone());
    bonds.add_map_listener(journal.clone());

    let bond = Bean::new("Bond");
    bond.set("instrumentId", 5);
    bond.set("type", "BOND");
    bond.set("code", "XS5");
    bond.set("coupon", 3.25);
    bonds.put(Key::from(5), Cached::Bean(bond.clone())).unwrap();

    assert!(Arc::ptr_eq(&instruments.get_bean(&Key::from(5)).unwrap().unwrap(), &bond));
    let by_code = instruments.get(&Key::from("XS5"), Some("byCode")).unwrap();
    assert!(Arc::ptr_eq(by_code.as_bean().unwrap(), &bond));
    // Ancestors see the change first
    assert_eq!(
        journal.take(),
        vec![
            ("Instrument".to_string(), MapEventKind::Insert),
            ("Instrument".to_string(), MapEventKind::Commit),
            ("Bond".to_string(), MapEventKind::Insert),
            ("Bond".to_string(), MapEventKind::Commit),
        ]
    );

    // A null takes the place of the bean everywhere
    bonds.put(Key::from(5), Cached::Null).unwrap();
    assert!(bonds.get(&Key::from(5), None).unwrap().is_null());
    assert!(instruments.get(&Key::from(5), None).unwrap().is_null());
    assert!(instruments.get(&Key::from("XS5"), Some("byCode")).unwrap().is_null());
    println!("✓ bond 5 put through Bond reached Instrument and byCode");
}

#[test]
fn test_lazy_collections_load_as_a_group() {
    let desk = Desk::new();
    let books = desk.factory("Book");
    let all = books.get_objects_matching(&CriterionGroup::all()).unwrap();
    assert_eq!(all.len(), 2);
    let rates = all.iter().find(|b| b.get("bookId") == Value::Int(1)).cloned().unwrap();
    let credit = all.iter().find(|b| b.get("bookId") == Value::Int(2)).cloned().unwrap();
    assert!(matches!(credit.get_raw("tradesCollection"), Value::Lazy(_)));

    assert_eq!(rates.get("tradesCollection").as_collection().unwrap().len(), 2);
    // Credit's trades came in with Rates'
    let selects = desk.source.select_count();
    let credit_trades = credit.get("tradesCollection");
    assert_eq!(desk.source.select_count(), selects);
    assert_eq!(credit_trades.as_collection().unwrap().len(), 1);
    println!("✓ both books' trades loaded on first access");
}

#[test]
fn test_clear_cascades_through_hierarchy() {
    let desk = Desk::new();
    let instruments = desk.factory("Instrument");
    let bonds = desk.factory("Bond");
    instruments.get_bean(&Key::from(1)).unwrap().unwrap();
    instruments.get_bean(&Key::from(2)).unwrap().unwrap();

    // Clearing a sub-type removes only its beans from the super type
    bonds.clear().unwrap();
    assert!(bonds.is_empty());
    assert!(!instruments.contains_key(&Key::from(1), None));
    assert!(instruments.contains_key(&Key::from(2), None));
    assert!(!instruments.contains_key(&Key::from("XS1"), Some("byCode")));

    // Clearing the super type empties every sub-type
    instruments.get_bean(&Key::from(1)).unwrap().unwrap();
    assert!(bonds.contains_key(&Key::from(1), None));
    instruments.clear().unwrap();
    assert!(instruments.is_empty());
    assert!(bonds.is_empty());
}

#[test]
fn test_circular_references_resolve_in_one_load() {
    let desk = Desk::new();
    let employees = desk.factory("Employee");

    let ada = employees.get_bean(&Key::from(1)).unwrap().unwrap();
    let grace = ada.get("manager").as_bean().cloned().unwrap();
    assert_eq!(grace.get("name"), Value::from("Grace"));
    assert!(Arc::ptr_eq(&grace.get("manager").as_bean().cloned().unwrap(), &ada));
    // Low quantity types are read whole, once
    assert_eq!(desk.source.select_count(), 1);
}

#[test]
fn test_indices_follow_removal_and_update() {
    let desk = Desk::new();
    let trades = desk.factory("Trade");

    let book_trades = trades.get(&Key::from(1), Some("byBook")).unwrap();
    let collection = book_trades.as_collection().cloned().unwrap();
    assert_eq!(collection.len(), 2);

    let first = trades.get_bean(&Key::from(1)).unwrap().unwrap();
    trades.remove(&Key::from(1)).unwrap();
    assert_eq!(collection.len(), 1);
    assert!(!collection.contains(first.id()));

    let second = trades.get(&Key::from("T-2"), Some("byReference")).unwrap();
    let second = second.as_bean().cloned().unwrap();
    second.set("bookId", 2);
    trades.update_value(&second).unwrap();
    assert!(collection.is_empty());
    let moved = trades.get(&Key::from(2), Some("byBook")).unwrap();
    assert!(moved.as_collection().unwrap().contains(second.id()));
    assert!(matches!(
        trades.get(&Key::from(1), Some("byNothing")),
        Err(bean_cache::CacheError::MissingIndex { .. })
    ));
}

#[test]
fn test_weak_entries_go_once_released() {
    let desk = Desk::new();
    let quotes = desk.factory("Quote");
    assert_eq!(quotes.reference_type(), ReferenceType::Weak);

    let quote = quotes.get_bean(&Key::from(1)).unwrap().unwrap();
    assert_eq!(quote.get("price"), Value::Float(101.5));
    drop(quote);
    // Held for the load that produced it, until the next outermost load
    assert!(quotes.contains_key(&Key::from(1), None));

    quotes.get_bean(&Key::from(2)).unwrap().unwrap();
    quotes.sweep();
    assert!(!quotes.contains_key(&Key::from(1), None));

    let reloaded = quotes.get_bean(&Key::from(1)).unwrap().unwrap();
    assert_eq!(reloaded.get("price"), Value::Float(101.5));
}

#[test]
fn test_notifications_apply_changes_and_fire_events() {
    let desk = Desk::new();
    let trades = desk.factory("Trade");
    let recorder = Arc::new(Recorder::default());
    trades.add_map_listener(recorder.clone());

    let first = trades.get_bean(&Key::from(1)).unwrap().unwrap();
    trades.get_bean(&Key::from(2)).unwrap().unwrap();
    recorder.take();

    let changes = MemoryTabularData::new("trade changes", TRADE_COLUMNS)
        .with_row(RowKind::Insert, trade_row(4, 2, "EUR", 10))
        .with_row(RowKind::Update, trade_row(1, 1, "GBP", 650))
        .with_row(RowKind::Delete, trade_row(2, 1, "EUR", 50));
    let beans = desk.notify("Trade", changes);

    assert_eq!(beans.len(), 3);
    assert!(Arc::ptr_eq(&beans[1], &first));
    assert_eq!(first.get("quantity"), Value::Int(650));
    let inserted = trades.get_bean(&Key::from(4)).unwrap().unwrap();
    assert_eq!(inserted.get("book").as_bean().unwrap().get("name"), Value::from("Credit"));
    assert!(!trades.contains_key(&Key::from(2), None));
    assert_eq!(
        recorder.take(),
        vec![
            MapEventKind::Insert,
            MapEventKind::Update,
            MapEventKind::Delete,
            MapEventKind::Commit
        ]
    );

    // Without key columns a delete empties the factory
    let purge = MemoryTabularData::new("trade purge", ["BOOK_ID"])
        .with_row(RowKind::Delete, vec![1.into()]);
    assert!(desk.notify("Trade", purge).is_empty());
    assert!(trades.is_empty());
    assert_eq!(recorder.take(), vec![MapEventKind::AllRows, MapEventKind::Commit]);
    println!("✓ notifications applied");
}

#[test]
fn test_reinserted_key_reuses_deleted_bean() {
    let desk = Desk::new();
    let trades = desk.factory("Trade");
    let second = trades.get_bean(&Key::from(2)).unwrap().unwrap();

    desk.notify(
        "Trade",
        MemoryTabularData::new("delete", TRADE_COLUMNS)
            .with_row(RowKind::Delete, trade_row(2, 1, "EUR", 50)),
    );
    assert!(!trades.contains_key(&Key::from(2), None));

    desk.notify(
        "Trade",
        MemoryTabularData::new("insert", TRADE_COLUMNS)
            .with_row(RowKind::Insert, trade_row(2, 1, "EUR", 60)),
    );
    let back = trades.get_bean(&Key::from(2)).unwrap().unwrap();
    assert!(Arc::ptr_eq(&back, &second));
    assert_eq!(second.get("quantity"), Value::Int(60));
}

#[test]
fn test_criteria_collection_stays_live() {
    let desk = Desk::new();
    let trades = desk.factory("Trade");
    let big = trades
        .get_bean_collection(CriterionGroup::new(
            "big",
            vec![Criterion::basic("quantity", CriterionOperator::Gt, vec![100.into()])],
        ))
        .unwrap();
    assert_eq!(big.len(), 1);

    desk.notify(
        "Trade",
        MemoryTabularData::new("grow", TRADE_COLUMNS)
            .with_row(RowKind::Update, trade_row(2, 1, "EUR", 1000)),
    );
    assert_eq!(big.len(), 2);

    desk.notify(
        "Trade",
        MemoryTabularData::new("drop", TRADE_COLUMNS)
            .with_row(RowKind::Delete, trade_row(1, 1, "GBP", 500)),
    );
    assert_eq!(big.len(), 1);
    assert_eq!(big.to_vec()[0].get("tradeId"), Value::Int(2));

    // Reading every trade brings the deleted one back from the source
    let all = trades.get_all_bean_collection().unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(big.len(), 1);
    assert!(Arc::ptr_eq(
        &all.to_vec()[0],
        &trades.get_all_bean_collection().unwrap().to_vec()[0]
    ));
}

#[test]
fn test_lifecycle_callbacks() {
    let lifecycle = Arc::new(CountingLifecycle::default());
    let desk = Desk::with_lifecycle(Some(lifecycle.clone()));
    let trades = desk.factory("Trade");

    trades.get_bean(&Key::from(1)).unwrap().unwrap();
    trades.get_bean(&Key::from(2)).unwrap().unwrap();
    assert_eq!(lifecycle.init.load(Ordering::SeqCst), 2);

    let changes = MemoryTabularData::new("trade changes", TRADE_COLUMNS)
        .with_row(RowKind::Insert, trade_row(4, 2, "EUR", 10))
        .with_row(RowKind::Update, trade_row(1, 1, "GBP", 650))
        .with_row(RowKind::Delete, trade_row(2, 1, "EUR", 50));
    desk.notify("Trade", changes);

    assert_eq!(lifecycle.init.load(Ordering::SeqCst), 3);
    assert_eq!(lifecycle.inserted.load(Ordering::SeqCst), 1);
    assert_eq!(lifecycle.updated.load(Ordering::SeqCst), 1);
    assert_eq!(lifecycle.deleted.load(Ordering::SeqCst), 1);
}

#[test]
fn test_clear_all_keeps_static_types() {
    let desk = Desk::new();
    let trades = desk.factory("Trade");
    let currencies = desk.factory("Currency");
    trades.get_bean(&Key::from(1)).unwrap().unwrap();
    assert!(!currencies.is_empty());

    desk.registry.clear_all(false, true).unwrap();
    assert!(trades.is_empty());
    assert!(!currencies.is_empty());

    desk.registry.clear_all(true, true).unwrap();
    assert!(currencies.is_empty());
}

#[test]
fn test_batches_resolve_references_to_each_other() {
    let desk = Desk::new();
    let teams = MemoryTabularData::new("teams", ["TEAM_ID", "NAME", "LEAD_ID"])
        .with_row(RowKind::Insert, vec![1.into(), "Reds".into(), 10.into()]);
    let players = MemoryTabularData::new("players", ["PLAYER_ID", "NAME", "TEAM_ID"])
        .with_row(RowKind::Insert, vec![10.into(), "Sam".into(), 1.into()]);

    let changed = desk
        .registry
        .process_notifications(vec![
            NotificationBatch::new("Team", Box::new(teams)),
            NotificationBatch::new("Player", Box::new(players)),
        ])
        .unwrap();
    assert_eq!(changed.len(), 2);

    let team = desk.factory("Team").get_bean(&Key::from(1)).unwrap().unwrap();
    let player = desk.factory("Player").get_bean(&Key::from(10)).unwrap().unwrap();
    assert!(Arc::ptr_eq(&team.get("lead").as_bean().cloned().unwrap(), &player));
    assert!(Arc::ptr_eq(&player.get("team").as_bean().cloned().unwrap(), &team));
    assert_eq!(team.get_path("lead.team.name"), Value::from("Reds"));
    println!("✓ team {} and lead {} refer to each other", team, player);
}

#[test]
fn test_lazy_constructor_property() {
    let desk = Desk::new();
    let trade = desk.factory("Trade").get_bean(&Key::from(1)).unwrap().unwrap();
    assert!(matches!(trade.get_raw("label"), Value::Lazy(_)));
    assert_eq!(trade.get("label"), Value::from("T-1 x500"));
    println!("✓ trade 1 labelled {}", trade.get("label").to_text().unwrap());
}

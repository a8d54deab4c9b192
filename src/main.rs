use bean_cache::{
    BeanFactoryRegistry, CacheConfig, Key, MemoryDataSource, MemoryTabularData, NotificationBatch,
    RowKind, SchemaRegistry, TabularBeanFactoryType,
};
use env_logger::Builder;
use log::info;
use std::sync::Arc;

const SCHEMAS: &str = r#"[
    {
        "type_name": "Currency",
        "primary_key": ["CODE"],
        "data_volatility": "LOW",
        "data_quantity": "LOW",
        "bean_factory_type": "tabular",
        "properties": [
            {"kind": "default", "name": "code", "column": "CODE", "data_type": "String"},
            {"kind": "default", "name": "name", "column": "NAME", "data_type": "String"}
        ]
    },
    {
        "type_name": "Book",
        "primary_key": ["BOOK_ID"],
        "bean_factory_type": "tabular",
        "properties": [
            {"kind": "default", "name": "bookId", "column": "BOOK_ID", "data_type": "Integer"},
            {"kind": "default", "name": "name", "column": "NAME", "data_type": "String"},
            {
                "kind": "foreign_key", "name": "trades", "type_name": "Trade",
                "cardinality": "MANY", "foreign_index": "byBook", "lazy": true,
                "parameters": [{"kind": "column", "column": "BOOK_ID"}]
            }
        ]
    },
    {
        "type_name": "Trade",
        "primary_key": ["TRADE_ID"],
        "reference_type": "SOFT",
        "bean_factory_type": "tabular",
        "indices": [{"name": "byBook", "unique": false, "columns": ["BOOK_ID"]}],
        "properties": [
            {"kind": "default", "name": "tradeId", "column": "TRADE_ID", "data_type": "Integer"},
            {"kind": "default", "name": "bookId", "column": "BOOK_ID", "data_type": "Integer"},
            {"kind": "default", "name": "quantity", "column": "QUANTITY", "data_type": "Integer"},
            {
                "kind": "foreign_key", "name": "book", "type_name": "Book", "cardinality": "ONE",
                "parameters": [{"kind": "column", "column": "BOOK_ID"}]
            },
            {
                "kind": "foreign_key", "name": "currency", "type_name": "Currency", "cardinality": "ONE",
                "parameters": [{"kind": "column", "column": "CCY"}]
            }
        ]
    }
]"#;

fn seed(source: &MemoryDataSource) {
    source.table("Currency", ["CODE", "NAME"]);
    source.insert("Currency", vec!["GBP".into(), "Sterling".into()]);
    source.insert("Currency", vec!["USD".into(), "US Dollar".into()]);

    source.table("Book", ["BOOK_ID", "NAME"]);
    source.insert("Book", vec![1.into(), "Rates".into()]);

    source.table("Trade", ["TRADE_ID", "BOOK_ID", "CCY", "QUANTITY"]);
    source.insert("Trade", vec![100.into(), 1.into(), "GBP".into(), 250.into()]);
    source.insert("Trade", vec![101.into(), 1.into(), "USD".into(), 40.into()]);
}

fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if it exists
    dotenvy::dotenv().ok();

    let config = CacheConfig::load()?;
    Builder::new().filter_level(config.level_filter()).init();

    println!("bean-cache: object-relational bean cache demo");
    println!(
        "Configuration loaded: data_source={}, inflation_wait={:?}",
        config.default_data_source,
        config.inflation_wait_timeout()
    );

    let source = Arc::new(MemoryDataSource::new());
    seed(&source);

    let schemas = SchemaRegistry::builder().json(SCHEMAS)?.build()?;
    let data_source = config.default_data_source.clone();
    let registry = BeanFactoryRegistry::builder(schemas)
        .config(config)
        .factory_type(Arc::new(
            TabularBeanFactoryType::new().with_source(&data_source, source.clone()),
        ))
        .build();

    let books = registry.get_instance("Book", None)?;
    let Some(book) = books.get_bean(&Key::from(1))? else {
        anyhow::bail!("book 1 is missing from the demo data");
    };
    info!("loaded {}", book);

    let trades = book.get("tradesCollection");
    for trade in trades.as_collection().map(|c| c.to_vec()).unwrap_or_default() {
        println!(
            "  trade {} quantity {} in {}",
            trade.get("tradeId").to_text().unwrap_or_default(),
            trade.get("quantity").to_text().unwrap_or_default(),
            trade.get_path("currency.name").to_text().unwrap_or_default()
        );
    }

    let changes =
        MemoryTabularData::new("demo notification", ["TRADE_ID", "BOOK_ID", "CCY", "QUANTITY"])
        .with_row(RowKind::Insert, vec![102.into(), 1.into(), "GBP".into(), 75.into()])
        .with_row(RowKind::Update, vec![101.into(), 1.into(), "USD".into(), 45.into()]);
    let changed = registry.process_notifications(vec![NotificationBatch::new(
        "Trade",
        Box::new(changes),
    )])?;
    println!("Notification applied to {} trades", changed.len());

    let trades = registry.get_instance("Trade", None)?;
    println!(
        "Trade cache holds {} entries, {} selects issued",
        trades.len(),
        source.select_count()
    );

    Ok(())
}

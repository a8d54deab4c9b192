use log::debug;

use crate::error::Result;
use crate::logic::transformer::TabularTransformer;
use crate::logic::{BeanFactoryRegistry, EventQueue};
use crate::model::{BeanRef, RowKind, TabularData};

/// Changed rows for one type, as delivered by a notification transport
pub struct NotificationBatch {
    pub type_name: String,
    /// Factory data source; the type's default if absent
    pub data_source: Option<String>,
    pub data: Box<dyn TabularData>,
}

impl NotificationBatch {
    pub fn new(type_name: &str, data: Box<dyn TabularData>) -> Self {
        Self {
            type_name: type_name.to_string(),
            data_source: None,
            data,
        }
    }

    pub fn with_data_source(mut self, data_source: &str) -> Self {
        self.data_source = Some(data_source.to_string());
        self
    }
}

impl BeanFactoryRegistry {
    /// Apply batches of changed rows as one unit. Every batch's first pass
    /// runs (each under its own hierarchy lock) before any derived property is
    /// assigned, so rows in one batch may refer to beans created by another.
    /// Change events are held back until every batch is applied.
    ///
    /// A DELETE batch without key columns clears its factory.
    pub fn process_notifications(&self, batches: Vec<NotificationBatch>) -> Result<Vec<BeanRef>> {
        let mut queue = EventQueue::new();
        let mut transformers: Vec<TabularTransformer> = Vec::new();
        let mut frames = Vec::new();
        let mut outcome: Result<()> = Ok(());

        let mut batches = batches.into_iter();
        for batch in batches.by_ref() {
            let mut data = batch.data;
            let factory = match self.get_instance(&batch.type_name, batch.data_source.as_deref()) {
                Ok(factory) => factory,
                Err(e) => {
                    data.close();
                    outcome = Err(e);
                    break;
                }
            };
            frames.push(self.enter_load_stack(&factory));

            let missing =
                TabularTransformer::missing_key_columns(factory.schema(), &data.columns());
            let keyless = match missing {
                Ok(missing) => !missing.is_empty(),
                Err(e) => {
                    data.close();
                    outcome = Err(e);
                    break;
                }
            };
            if keyless {
                let first = data.next_row();
                if matches!(&first, Ok(Some(row)) if row.kind() == RowKind::Delete) {
                    data.close();
                    debug!("{}delete without key columns, clearing", factory.log_prefix());
                    if let Err(e) = factory.clear_with(Some(&mut queue), true, true) {
                        outcome = Err(e);
                        break;
                    }
                    continue;
                }
            }

            let mut transformer = match TabularTransformer::new(factory.clone()) {
                Ok(transformer) => transformer,
                Err(e) => {
                    data.close();
                    outcome = Err(e);
                    break;
                }
            };
            let first = {
                let _guard = factory.lock();
                let result = transformer.first_pass(data.as_mut());
                data.close();
                result
            };
            transformers.push(transformer);
            if let Err(e) = first {
                outcome = Err(e);
                break;
            }
        }
        for batch in batches {
            let mut data = batch.data;
            data.close();
        }

        if outcome.is_ok() {
            outcome = (|| -> Result<()> {
                for transformer in transformers.iter_mut() {
                    transformer.resolve_find_later();
                    transformer.queue_change_events(&mut queue)?;
                }
                for transformer in transformers.iter_mut().rev() {
                    transformer.second_pass();
                }
                for transformer in &transformers {
                    transformer.queue_commit(&mut queue)?;
                }
                Ok(())
            })();
        }
        for transformer in &transformers {
            transformer.release();
        }
        if outcome.is_ok() {
            for transformer in &transformers {
                transformer.fire_lifecycle();
            }
        }

        let beans: Vec<BeanRef> = transformers.iter().flat_map(|t| t.beans()).collect();
        debug!(
            "processed notifications for {} factories, {} beans",
            transformers.len(),
            beans.len()
        );
        drop(frames);
        outcome?;
        queue.fire(self);
        Ok(beans)
    }
}

//! Channel records accumulated from `channelAdd` / `channelUpdate` pushes.

use std::collections::BTreeMap;

use log::{debug, info, warn};
use parking_lot::Mutex;
use url::Url;

use htsp_protocol::{channel_field, ChannelInfo, ChannelType, Message, ProtocolError};

/// Raw channel records keyed by channel id.
///
/// Records are only ever added or updated, never removed.
#[derive(Default)]
pub struct ChannelAggregator {
    records: Mutex<BTreeMap<i64, Message>>,
}

impl ChannelAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one add/update notification. Errors are logged and swallowed so
    /// one bad message never stops the ones after it.
    pub fn merge(&self, message: &Message) {
        if let Err(e) = self.try_merge(message) {
            warn!("Ignoring channel notification: {} ({})", e, message);
        }
    }

    fn try_merge(&self, message: &Message) -> Result<(), ProtocolError> {
        let id = message.get_int(channel_field::ID)?;
        let mut records = self.records.lock();

        if let Some(existing) = records.remove(&id) {
            let mut record = existing.into_builder();
            for (name, value) in message.iter() {
                record.set(name, value.clone());
            }
            records.insert(id, record.build());
            return Ok(());
        }

        let number = message.get_int_or(channel_field::NUMBER, 0)?;
        if number > 0 {
            debug!("New channel {} (number {})", id, number);
            records.insert(id, message.clone());
        } else {
            debug!("Channel {} has no number yet; not tracked", id);
        }
        Ok(())
    }

    /// Number of tracked channel records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw record for `id`, if tracked.
    pub fn record(&self, id: i64) -> Option<Message> {
        self.records.lock().get(&id).cloned()
    }

    /// Project every usable record into a [`ChannelInfo`], ordered by id.
    ///
    /// Records without a name or without a recognised first service are
    /// left out.
    pub fn build_channel_infos(&self) -> Vec<ChannelInfo> {
        let snapshot: Vec<(i64, Message)> = self
            .records
            .lock()
            .iter()
            .map(|(id, record)| (*id, record.clone()))
            .collect();

        let mut infos = Vec::with_capacity(snapshot.len());
        for (id, record) in &snapshot {
            match channel_info(*id, record) {
                Ok(Some(info)) => infos.push(info),
                Ok(None) => {}
                Err(e) => warn!("Skipping channel {}: {}", id, e),
            }
        }
        infos
    }
}

fn channel_info(id: i64, record: &Message) -> Result<Option<ChannelInfo>, ProtocolError> {
    let name = match record.get_str(channel_field::NAME) {
        Ok(name) if !name.is_empty() => name.to_string(),
        _ => {
            debug!("Channel {} has no name", id);
            return Ok(None);
        }
    };

    let major = record.get_int(channel_field::NUMBER)?;
    let number = if record.contains(channel_field::NUMBER_MINOR) {
        format!("{}.{}", major, record.get_int(channel_field::NUMBER_MINOR)?)
    } else {
        major.to_string()
    };

    let image_url = record
        .get_str(channel_field::ICON)
        .ok()
        .filter(|url| is_http_url(url))
        .map(str::to_string);

    let service = match record
        .get_list(channel_field::SERVICES)
        .ok()
        .and_then(|services| services.first())
    {
        Some(service) => service,
        None => {
            info!("Channel {} ({}) has no services", id, name);
            return Ok(None);
        }
    };

    let tag = service.get_str(channel_field::SERVICE_TYPE).unwrap_or("");
    let channel_type = match ChannelType::from_service_type(tag) {
        Some(channel_type) => channel_type,
        None => {
            info!("Channel {} ({}): unsupported service type '{}'", id, name, tag);
            return Ok(None);
        }
    };

    Ok(Some(ChannelInfo {
        id: id.to_string(),
        name,
        number,
        image_url,
        channel_type,
    }))
}

/// Absolute URL with the plain `http` scheme and a host.
fn is_http_url(url: &str) -> bool {
    match Url::parse(url) {
        Ok(url) => url.scheme() == "http" && url.host().is_some(),
        Err(_) => false,
    }
}

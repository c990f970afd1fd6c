//! Creative-dependent decision for a dispatched event
//!
//! A missing creative or one that cannot be rendered is a data-integrity
//! fault: it is logged and counted, and the caller gets `NoContent` instead
//! of an error.

use rtb_common::{CreativeClass, CreativeRecord, Decision, Event, EventContext, EventOptions};
use tracing::error;

use crate::creative::CreativeCache;
use crate::dispatch_metrics;

pub fn decide(event: &Event, options: &EventOptions, creatives: &dyn CreativeCache) -> Decision {
    match event {
        Event::Win { .. } => Decision::Successful,
        Event::Impression(context) => match find_creative(context, options, creatives) {
            Some(creative) => impression_decision(context, &creative, options),
            None => Decision::NoContent,
        },
        Event::Click(context) => match find_creative(context, options, creatives) {
            Some(creative) => match creative.ctr_url.as_deref() {
                Some(url) => Decision::Redirect(url.to_string()),
                None => integrity_fault(context, options, "missing_ctr_url", "Creative has no click-through URL"),
            },
            None => Decision::NoContent,
        },
    }
}

fn impression_decision(context: &EventContext, creative: &CreativeRecord, options: &EventOptions) -> Decision {
    match &creative.class {
        CreativeClass::Html5 => match creative.html.as_deref() {
            Some(html) => Decision::Html(append_click_tag(html, options.click_tag.as_deref())),
            None => integrity_fault(context, options, "missing_html", "html5 creative has no markup"),
        },
        CreativeClass::Banner => match creative.path.as_deref() {
            Some(path) => Decision::AssetPath(path.to_string()),
            None => integrity_fault(context, options, "missing_path", "Banner creative has no asset path"),
        },
        CreativeClass::Unknown(tag) => {
            record_fault(options, "unknown_class");
            error!(
                campaign_id = context.campaign_id,
                creative_id = context.creative_id,
                class = %tag,
                "Unrecognized creative class"
            );
            Decision::NoContent
        }
    }
}

/// Dry runs still log the fault but leave the counters alone.
fn record_fault(options: &EventOptions, kind: &str) {
    if !options.test {
        dispatch_metrics::record_data_integrity_fault(kind);
    }
}

/// Append `&ct=<tag>` verbatim. Without a tag the markup is returned as stored.
pub fn append_click_tag(html: &str, click_tag: Option<&str>) -> String {
    match click_tag {
        Some(tag) => format!("{}&ct={}", html, tag),
        None => html.to_string(),
    }
}

fn find_creative(
    context: &EventContext,
    options: &EventOptions,
    creatives: &dyn CreativeCache,
) -> Option<std::sync::Arc<CreativeRecord>> {
    let found = creatives.lookup(context.campaign_id, context.creative_id);
    if found.is_none() {
        record_fault(options, "missing_creative");
        error!(
            bid_id = %context.bid_id,
            campaign_id = context.campaign_id,
            creative_id = context.creative_id,
            "Creative not found"
        );
    }
    found
}

fn integrity_fault(context: &EventContext, options: &EventOptions, kind: &str, message: &str) -> Decision {
    record_fault(options, kind);
    error!(
        campaign_id = context.campaign_id,
        creative_id = context.creative_id,
        kind = kind,
        "{}",
        message
    );
    Decision::NoContent
}

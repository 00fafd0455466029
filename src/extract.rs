use crate::error::EngineError;
use chromiumoxide::Page;
use log::{debug, warn};
use std::collections::HashSet;
use std::future::Future;

/// Anchors wrapping each post thumbnail on a listing page.
const POST_LINK_SELECTOR: &str = ".grid.grid-show .post-image-wrapper > a";

/// One way of finding image URLs on a post page.
struct SelectorStrategy {
    selector: &'static str,
    attribute: &'static str,
    /// Drop matches that do not look like image URLs. Needed for the anchor
    /// fallback, which also matches links to other posts.
    images_only: bool,
}

/// Ordered extraction strategies for a post page. The gallery slider is the
/// primary source; content-body anchors are the fallback for older post
/// layouts without a slider.
const IMAGE_STRATEGIES: &[SelectorStrategy] = &[
    SelectorStrategy {
        selector: ".post-slider-item.open-gallery img",
        attribute: "src",
        images_only: false,
    },
    SelectorStrategy {
        selector: ".post-content a",
        attribute: "href",
        images_only: true,
    },
];

/// Collect post-page URLs from the currently loaded listing page, in document
/// order, deduplicated.
pub async fn extract_post_links(page: &Page) -> Result<Vec<String>, EngineError> {
    collect_attributes(page, POST_LINK_SELECTOR, "href").await
}

/// Collect image URLs from the currently loaded post page.
pub async fn extract_image_urls(page: &Page) -> Vec<String> {
    select_image_urls(|selector, attribute| collect_attributes(page, selector, attribute)).await
}

/// Run the extraction strategies in order against `query`; the first one
/// yielding any image URLs wins. A failing strategy counts as yielding none.
async fn select_image_urls<F, Fut>(mut query: F) -> Vec<String>
where
    F: FnMut(&'static str, &'static str) -> Fut,
    Fut: Future<Output = Result<Vec<String>, EngineError>>,
{
    for strategy in IMAGE_STRATEGIES {
        match query(strategy.selector, strategy.attribute).await {
            Ok(mut urls) if !urls.is_empty() => {
                if strategy.images_only {
                    urls.retain(|u| crate::fetch::looks_like_image(u));
                    if urls.is_empty() {
                        continue;
                    }
                }
                debug!("Selector {:?} matched {} image(s)", strategy.selector, urls.len());
                return urls;
            }
            Ok(_) => {}
            Err(e) => warn!("Selector {:?} failed: {}", strategy.selector, e),
        }
    }
    Vec::new()
}

/// Gather a non-empty attribute from every element matching `selector`,
/// preserving document order and dropping duplicates.
async fn collect_attributes(
    page: &Page,
    selector: &str,
    attribute: &str,
) -> Result<Vec<String>, EngineError> {
    let elements = page
        .find_elements(selector)
        .await
        .map_err(|e| EngineError::Extraction(format!("{}: {}", selector, e)))?;

    let mut seen = HashSet::new();
    let mut values = Vec::new();
    for element in elements {
        let value = element
            .attribute(attribute)
            .await
            .map_err(|e| EngineError::Extraction(format!("{}[{}]: {}", selector, attribute, e)))?;
        if let Some(value) = value {
            if !value.is_empty() && seen.insert(value.clone()) {
                values.push(value);
            }
        }
    }
    Ok(values)
}
